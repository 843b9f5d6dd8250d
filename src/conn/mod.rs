pub mod exchange;

pub use exchange::data_exchange;
