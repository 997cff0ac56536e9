pub mod pool;
pub mod reconcile;
