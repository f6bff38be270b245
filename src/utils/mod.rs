pub mod chunk_decoder;
pub mod credentials;
pub mod path_utils;
pub mod run_logger;
