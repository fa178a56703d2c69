pub mod audit;
pub mod batch;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection_pool;
pub mod credentials;
pub mod error;
pub mod integration;
pub mod logging;
pub mod memory_store;
pub mod models;
pub mod monitor;
pub mod persistence;
pub mod sync;

pub use client::{
    ConnectionStatus, IssueExistence, IssueLookup, JiraClient, TestResultSummary, TestVerdict,
};
pub use error::{Error, FailureKind, Result};
pub use models::*;

// Configuration re-exports
pub use config::{
    AuditConfig, BatchConfig, ClientConfig, IntegrationConfig, LoggingConfig, MonitorConfig,
    PoolConfig, SchedulerConfig,
};
pub use credentials::{Credentials, is_valid_issue_key};

// Component re-exports
pub use audit::{AuditEventType, AuditLogEntry, AuditLogger};
pub use batch::{
    BatchProcessor, BatchResult, BatchStatsSnapshot, BatchSummary, CommentRequest, ItemOutcome,
};
pub use connection_pool::{ConnectionPool, ConnectionPoolStats, PooledConnection};
pub use monitor::{HealthMonitor, HealthStatus, HourlyReport, SystemMetrics};
pub use sync::{RecordOutcome, SyncPassReport, SyncReconciler};

// Persistence re-exports
pub use memory_store::{InMemoryCredentialSource, InMemorySyncStore, PlainTextDecryptor};
pub use persistence::{
    CredentialSource, SecretDecryptor, StoredCredentials, SyncRecord, SyncRecordStore, SyncStatus,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use integration::JiraIntegration;
pub use logging::{LoggingGuard, init_logging};
