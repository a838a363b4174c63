pub mod pipeline_run;
pub mod publish_audit;
pub mod publish_cooldown;
pub mod queue_item;
pub mod test_utils;
pub mod workspace;
pub mod workspace_event;
pub mod workspace_mode;
