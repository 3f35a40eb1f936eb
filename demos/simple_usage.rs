/// Kestrel API Demo
///
/// Demonstrates the major collection operations:
/// - Put, get, update and delete inside Transaction Sets
/// - Indexed, unindexed and relational searches
/// - Plans chosen by the query planner

use kestrel::core::context::RequestContext;
use kestrel::core::database::Database;
use kestrel::core::types::{Record, Value};
use kestrel::query::condition::{Comparator, Condition};
use kestrel::query::types::{SearchRequest, SortOrder};
use kestrel::schema::schema::{Attribute, AttributeKind, Relationship, Schema};
use kestrel::storage::key::Key;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║   Kestrel Database - API Demo                 ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    // Step 1: Create database and collections
    println!("Creating collections...");
    let db = Database::default();
    let authors = db.create_collection(
        "authors",
        Schema::new("id").with_attribute(Attribute::new("name", AttributeKind::String).indexed()),
    )?;
    let books = db.create_collection(
        "books",
        Schema::new("id")
            .with_attribute(Attribute::new("title", AttributeKind::String).indexed())
            .with_attribute(Attribute::new("year", AttributeKind::Int).indexed())
            .with_attribute(Attribute::new("author_id", AttributeKind::Int).indexed())
            .with_attribute(Attribute::new("author", AttributeKind::Any).relationship(Relationship::From {
                collection: "authors".into(),
                local_attribute: "author_id".into(),
            })),
    )?;
    println!("Done!\n");

    // Step 2: INSERT - one Transaction Set, one commit timestamp
    println!("Step 2: INSERT - Adding records...");
    let mut ctx = RequestContext::new();
    let (_, commit) = db.transaction(&mut ctx, |ctx| {
        authors.put(ctx, Record::from_json(serde_json::json!({"id": 1, "name": "Ursula"}))?)?;
        authors.put(ctx, Record::from_json(serde_json::json!({"id": 2, "name": "Stanislaw"}))?)?;
        books.put(ctx, Record::from_json(serde_json::json!({"id": 10, "title": "The Dispossessed", "year": 1974, "author_id": 1}))?)?;
        books.put(ctx, Record::from_json(serde_json::json!({"id": 11, "title": "The Lathe of Heaven", "year": 1971, "author_id": 1}))?)?;
        books.put(ctx, Record::from_json(serde_json::json!({"id": 12, "title": "Solaris", "year": 1961, "author_id": 2}))?)?;
        Ok(())
    })?;
    if let Some(commit) = commit {
        println!("  Inserted 5 records at timestamp {}\n", commit.commit_timestamp);
    }

    // Step 3: SEARCH - Different condition shapes
    println!("Step 3: SEARCH - Querying records...");
    let searches = [
        ("year >= 1970", SearchRequest::new(Condition::leaf("year", Comparator::GreaterThanEqual, 1970))),
        ("title = The*", SearchRequest::new(Condition::equals("title", "The*"))),
        (
            "author.name = Ursula",
            SearchRequest::new(Condition::path(&["author", "name"], Comparator::Equals, "Ursula")),
        ),
        ("all, newest first", SearchRequest::all().sort_by("year", SortOrder::Desc)),
    ];
    for (label, request) in searches {
        let plan = books.explain(request.clone())?;
        let titles: Vec<String> = books
            .search(&ctx, request)?
            .filter_map(|record| record.ok())
            .filter_map(|record| record.get("title").and_then(Value::as_str).map(str::to_string))
            .collect();
        println!("  '{}': {:?}", label, titles);
        println!("    plan: {:?}", plan);
    }
    println!();

    // Step 4: UPDATE - Patches replay on conflict
    println!("Step 4: UPDATE - Updating a record...");
    books.update(&mut ctx, &Key::Int(12), |record| record.set("year", Value::Int(1962)))?;
    if let Some(book) = books.get(&ctx, &Key::Int(12))? {
        println!("  Solaris year is now {:?}\n", book.get("year"));
    }

    // Step 5: DELETE
    println!("Step 5: DELETE - Removing a record...");
    let existed = books.delete(&mut ctx, &Key::Int(11))?;
    println!("  Deleted book 11: {}\n", existed);

    // Step 6: Maintenance
    println!("Step 6: VACUUM - Dropping unreachable versions...");
    let removed = db.vacuum()?;
    println!("  Removed {} versions", removed);
    println!("  Collections: {:?}\n", db.catalog().names());

    Ok(())
}
