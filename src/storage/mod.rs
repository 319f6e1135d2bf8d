pub mod commit;
pub mod parquet_writer;

pub use commit::{
    find_trades_file, is_safe_dir_name, list_instrument_dirs, read_metadata, InstrumentStore,
    RecoveryReport, METADATA_FILE_NAME,
};
pub use parquet_writer::{write_trade_table, TRADES_SCHEMA_VERSION};
