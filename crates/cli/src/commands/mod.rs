pub mod chat_file;
pub mod config_cmd;
pub mod generate;
pub mod normalize;
pub mod pack;
