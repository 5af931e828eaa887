pub mod chunk_cache;
