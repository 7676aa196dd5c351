pub mod enqueue_message;
pub mod prune_queue;
pub mod queue_stats;
