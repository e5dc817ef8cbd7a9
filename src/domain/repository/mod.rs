pub mod counter_store;

pub use counter_store::CheckAndIncrementResult;
pub use counter_store::CounterStore;
