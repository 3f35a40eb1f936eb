pub mod core;
pub mod schema;
pub mod record;
pub mod storage;
pub mod mvcc;
pub mod query;
pub mod search;
pub mod writer;

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                             KESTREL STRUCT ARCHITECTURE                                     │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── CORE LAYER ──────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                               struct Database                                       │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ config: Arc<Config>               // Engine tunables                         │ │    │
│  │  │ mvcc: Arc<MVCCController>         // Timestamps + read views                 │ │    │
│  │  │ catalog: Arc<Catalog>             // Collections, relationship resolution    │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                               struct Collection                                     │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ name: String                                                                 │ │    │
│  │  │ schema: Arc<Schema>               // Attributes, identity, relationships     │ │    │
│  │  │ store: Arc<dyn KvStore>           // Versioned ordered store + indexes       │ │    │
│  │  │ stats: Arc<CollectionStats>       // TTL counts for the cost estimator       │ │    │
│  │  │ catalog: Weak<Catalog>            // Back reference for joins                │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────────────────────────┐    │
│  │ struct Config    │  │ struct Record    │  │ struct RequestContext                 │    │
│  │ • max_key_bytes  │  │ • fields:        │  │ • authorized: bool                    │    │
│  │ • scan_batch_size│  │   BTreeMap<String│  │ • select_restriction                  │    │
│  │ • allow_full_scan│  │   , Value>       │  │ • transaction: Option<Arc<TxSet>>     │    │
│  │ • adaptive_*     │  └──────────────────┘  └───────────────────────────────────────┘    │
│  │ • *_fraction     │                                                                      │
│  └──────────────────┘  ┌──────────────────┐  ┌───────────────────────────────────────┐    │
│                        │ enum Value       │  │ enum Key                              │    │
│                        │ • Null / Bool    │  │ • Null < Bool < Int|Float < Str       │    │
│                        │ • Int / Float    │  │   < Bytes < Tuple < Max               │    │
│                        │ • String / Date  │  │ • truncated + OVERFLOW_MARKER         │    │
│                        │ • Array(Arc<..>) │  └───────────────────────────────────────┘    │
│                        │ • Object(Arc<..>)│                                                │
│                        └──────────────────┘                                                │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── TRANSACTION LAYER ──────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                           struct TransactionSet                                     │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ id: u64                                  // Unique transaction ID            │ │    │
│  │  │ view: ReadView                           // Pinned snapshot                  │ │    │
│  │  │ entries: Mutex<Vec<Arc<dyn SubTransaction>>>                                 │ │    │
│  │  │ timestamp: Mutex<Option<Timestamp>>      // Assigned on first commit         │ │    │
│  │  │ state: RwLock<TransactionState>          // Active/Preparing/Committed      │ │    │
│  │  │ resources: Mutex<ResourceCache>          // One RecordWrite per key         │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌────────────────────────┐  ┌─────────────────────────┐  ┌────────────────────┐          │
│  │ struct RecordWrite     │  │ struct TrackedRecord    │  │ struct TrackedList │          │
│  │ • read_version (CAS)   │  │ • base: Arc<Record>     │  │ • base: Arc<Vec>   │          │
│  │ • intent: put/delete/  │  │ • own: copy-on-write    │  │ • own: Vec<Slot>   │          │
│  │   patch (replayable)   │  │ • collapse()            │  │ • collapse()       │          │
│  └────────────────────────┘  └─────────────────────────┘  └────────────────────┘          │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── QUERY LAYER ──────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐  ┌──────────────────────┐  ┌─────────────────────┐            │
│  │ enum Condition         │  │ struct CostEstimator │  │ enum Plan           │            │
│  │ • Leaf(attr path,      │  │ • pk equals = 1      │  │ • FullScan          │            │
│  │   comparator, value)   │  │ • OR sums, AND       │  │ • IndexRange        │            │
│  │ • Group(and/or)        │  │   chains ratios      │  │ • Join / Intersect  │            │
│  │ • memoized estimate    │  └──────────────────────┘  │ • Union / Sort      │            │
│  └────────────────────────┘                            └─────────────────────┘            │
│  ┌────────────────────────┐  ┌──────────────────────┐  ┌─────────────────────┐            │
│  │ struct AdaptiveFilter  │  │ struct JoinResolver  │  │ struct ResultStream │            │
│  │ • Scanning{misses}     │  │ • join_from (fk here)│  │ • offset / limit    │            │
│  │ • IndexBacked(keys)    │  │ • join_to (fk there) │  │ • close hook, once  │            │
│  └────────────────────────┘  └──────────────────────┘  └─────────────────────┘            │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────── RELATIONSHIPS ────────────────────────────────────────────┐
│                                                                                              │
│  Database ──owns──> Catalog ──holds──> Collection ──owns──> KvStore (MemoryStore)           │
│     │                                      │                                                │
│     ├──owns──> MVCCController ──pins──> ReadView                                            │
│     │                                      │                                                │
│     │                                      ├──search()──> QueryPlanner ──uses──> CostEstimator
│     │                                      │                   │                            │
│     │                                      │                   └──generates──> Plan         │
│     │                                      │                                                │
│     │                                      ├──runs──> ConditionExecutor ──> ResultStream    │
│     │                                      │              ├──> search_by_index (RangeCursor)│
│     │                                      │              ├──> AdaptiveFilter               │
│     │                                      │              └──> JoinResolver ──> Catalog     │
│     │                                      │                                                │
│     └──transaction()──> TransactionSet ──registers──> RecordWrite ──edits──> TrackedRecord  │
│                              │                                                              │
│                              └──commit──> compare_and_put at one timestamp                  │
│                                                                                              │
└──────────────────────────────────────────────────────────────────────────────────────────────┘
*/
