pub mod batch_claimer;
pub mod batch_dispatcher;
