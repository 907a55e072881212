#[derive(Clone, Debug)]
pub struct StaticConfigItem {
    pub key: &'static str,
    pub description: &'static str,
    pub value_type: &'static str,
    pub default_value: &'static str,
}

pub static STATIC_CONFIG_TABLE: &[StaticConfigItem] = &[
    StaticConfigItem {
        key: "storage.dsn",
        description: "Changelog database connection string (sqlite: prefix or PostgreSQL DSN)",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "storage.sqlite_path",
        description: "SQLite database path (used when storage.dsn is empty)",
        value_type: "string",
        default_value: "changetrail.sqlite",
    },
    StaticConfigItem {
        key: "storage.archive_path",
        description: "SQLite cold namespace for archived partitions (empty: <sqlite path>.archive)",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "capture.mode",
        description: "Capture mode: sync writes records inline, async queues them for the worker",
        value_type: "string",
        default_value: "sync",
    },
    StaticConfigItem {
        key: "capture.strict",
        description: "Abort the triggering mutation when capture fails",
        value_type: "boolean",
        default_value: "true",
    },
    StaticConfigItem {
        key: "worker.interval_ms",
        description: "Delay between capture worker cycles in milliseconds",
        value_type: "number",
        default_value: "1000",
    },
    StaticConfigItem {
        key: "worker.batch_size",
        description: "Maximum queue entries claimed per worker cycle",
        value_type: "number",
        default_value: "100",
    },
    StaticConfigItem {
        key: "worker.lease_ms",
        description: "Claim lease in milliseconds before an entry becomes claimable again",
        value_type: "number",
        default_value: "30000",
    },
    StaticConfigItem {
        key: "alerts.interval_ms",
        description: "Delay between alert evaluation cycles in milliseconds",
        value_type: "number",
        default_value: "60000",
    },
    StaticConfigItem {
        key: "partitions.period",
        description: "Partition period: daily or monthly",
        value_type: "string",
        default_value: "monthly",
    },
    StaticConfigItem {
        key: "partitions.ahead",
        description: "Number of future partitions kept ready",
        value_type: "number",
        default_value: "2",
    },
    StaticConfigItem {
        key: "partitions.interval_ms",
        description: "Delay between partition maintenance cycles in milliseconds",
        value_type: "number",
        default_value: "3600000",
    },
    StaticConfigItem {
        key: "retention.horizon_days",
        description: "Partitions ending this many days ago or earlier are retired",
        value_type: "number",
        default_value: "365",
    },
    StaticConfigItem {
        key: "retention.action",
        description: "What happens to expired partitions: archive or drop",
        value_type: "string",
        default_value: "archive",
    },
    StaticConfigItem {
        key: "retention.max_attempts",
        description: "Attempts per partition within one retention cycle",
        value_type: "number",
        default_value: "3",
    },
    StaticConfigItem {
        key: "security.admin_token",
        description: "Bearer token for the admin API (empty disables admin routes)",
        value_type: "string",
        default_value: "",
    },
];
