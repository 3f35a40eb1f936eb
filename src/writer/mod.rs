pub mod record_write;
