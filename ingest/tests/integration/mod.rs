mod fallback;
mod insert_rows;
mod support;
mod upsert;
