//! Broker topic name constants (spec §6 table).

pub const PREPARE_TOPIC: &str = "prepare_topic";
pub const STORE_TOPIC: &str = "store_topic";
pub const RECORD_TOPIC: &str = "record_topic";
pub const CLEANUP_TOPIC: &str = "cleanup_topic";
pub const REPLICATE_TOPIC: &str = "replicate_topic";
pub const RESTORE_TOPIC: &str = "restore_topic";
pub const DELETE_TOPIC: &str = "delete_topic";
pub const FIXITY_TOPIC: &str = "fixity_topic";
pub const TROUBLE_TOPIC: &str = "trouble_topic";
pub const FAILED_REPLICATION_TOPIC: &str = "failed_replication_topic";
pub const FAILED_FIXITY_TOPIC: &str = "failed_fixity_topic";
