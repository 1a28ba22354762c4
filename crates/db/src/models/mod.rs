pub mod attachment;
pub mod conversation_result;
pub mod dev_environment;
pub mod execution_log;
pub mod project;
pub mod task;
pub mod task_conversation;
