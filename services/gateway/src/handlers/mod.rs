pub mod prices;
pub mod root;
pub mod stats;
pub mod ws;
