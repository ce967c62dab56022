use crate::capability::{
    DatabaseControl, DatabaseControlError, DatabaseMetadata, ReplicationStatus, SqlClient,
    SqlError, StandbyConnection, UpstreamNode,
};
use crate::lsn::Lsn;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// One simulated database server, implementing both the process-control and
/// the SQL seams over the same state so tests see a consistent picture.
/// Every mutation is appended to an event journal, which scenario tests use
/// to assert ordering (the split-brain defense is an ordering property).
pub struct FakePostgres {
    inner: Mutex<Sim>,
}

struct Sim {
    data_directory_exists: bool,
    running: bool,
    in_recovery: bool,
    read_only: bool,
    system_identifier: u64,
    timeline_id: u32,
    port: u16,
    current_lsn: Lsn,
    slots: BTreeSet<String>,
    access_rules: BTreeSet<String>,
    sync_standby_names: Option<String>,
    replication_users: BTreeSet<String>,
    standby_upstream: Option<Option<UpstreamNode>>,
    connected_standbys: Vec<StandbyConnection>,
    database_created: bool,
    start_failures_remaining: u32,
    events: Vec<String>,
}

impl FakePostgres {
    /// An empty node: no data directory at all.
    pub fn empty(port: u16) -> Self {
        FakePostgres {
            inner: Mutex::new(Sim {
                data_directory_exists: false,
                running: false,
                in_recovery: false,
                read_only: false,
                system_identifier: 0,
                timeline_id: 1,
                port,
                current_lsn: Lsn::zero(),
                slots: BTreeSet::new(),
                access_rules: BTreeSet::new(),
                sync_standby_names: None,
                replication_users: BTreeSet::new(),
                standby_upstream: None,
                connected_standbys: Vec::new(),
                database_created: false,
                start_failures_remaining: 0,
                events: Vec::new(),
            }),
        }
    }

    /// A node already running as a primary with the given identity.
    pub fn running_primary(port: u16, system_identifier: u64) -> Self {
        let fake = FakePostgres::empty(port);
        {
            let mut sim = fake.inner.lock().unwrap();
            sim.data_directory_exists = true;
            sim.running = true;
            sim.system_identifier = system_identifier;
            sim.database_created = true;
        }
        fake
    }

    /// A node running as a standby streaming from some upstream.
    pub fn running_standby(port: u16, system_identifier: u64) -> Self {
        let fake = FakePostgres::running_primary(port, system_identifier);
        fake.inner.lock().unwrap().in_recovery = true;
        fake
    }

    pub fn set_connected_standbys(&self, standbys: Vec<StandbyConnection>) {
        self.inner.lock().unwrap().connected_standbys = standbys;
    }

    pub fn set_current_lsn(&self, lsn: Lsn) {
        self.inner.lock().unwrap().current_lsn = lsn;
    }

    /// Make the next `n` start attempts fail, for restart-budget tests.
    pub fn fail_next_starts(&self, n: u32) {
        let mut sim = self.inner.lock().unwrap();
        sim.running = false;
        sim.start_failures_remaining = n;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    /// The property the split-brain scenarios assert over: a server counts
    /// as accepting writes only when up, out of recovery, and not forced
    /// read-only.
    pub fn accepts_writes(&self) -> bool {
        let sim = self.inner.lock().unwrap();
        sim.running && !sim.in_recovery && !sim.read_only
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.inner.lock().unwrap().slots.contains(name)
    }

    pub fn has_access_rule(&self, host: &str) -> bool {
        self.inner.lock().unwrap().access_rules.contains(host)
    }

    pub fn has_replication_user(&self, name: &str) -> bool {
        self.inner.lock().unwrap().replication_users.contains(name)
    }

    pub fn database_created(&self) -> bool {
        self.inner.lock().unwrap().database_created
    }

    pub fn sync_standby_names(&self) -> Option<String> {
        self.inner.lock().unwrap().sync_standby_names.clone()
    }

    /// The last standby-mode configuration written, if any: `Some(None)`
    /// means standby mode with no upstream (frozen replay).
    pub fn standby_upstream(&self) -> Option<Option<UpstreamNode>> {
        self.inner.lock().unwrap().standby_upstream.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.lock().unwrap().events.clone()
    }
}

#[async_trait::async_trait]
impl DatabaseControl for FakePostgres {
    async fn initialize(&self) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.data_directory_exists {
            return Err(DatabaseControlError(
                "data directory already exists".to_string(),
            ));
        }
        sim.data_directory_exists = true;
        sim.system_identifier = 7_000_000_000_000_000_001;
        sim.events.push("initialize".to_string());
        Ok(())
    }

    fn data_directory_exists(&self) -> bool {
        self.inner.lock().unwrap().data_directory_exists
    }

    async fn ensure_running(&self) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.running {
            return Ok(());
        }
        if sim.start_failures_remaining > 0 {
            sim.start_failures_remaining -= 1;
            sim.events.push("start_failed".to_string());
            return Err(DatabaseControlError("server refused to start".to_string()));
        }
        sim.running = true;
        sim.events.push("start".to_string());
        Ok(())
    }

    async fn ensure_stopped(&self) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.running {
            sim.running = false;
            sim.connected_standbys.clear();
            sim.events.push("stop".to_string());
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.running = true;
        sim.events.push("restart".to_string());
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    async fn promote(&self) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        if !sim.running {
            return Err(DatabaseControlError(
                "cannot promote a stopped server".to_string(),
            ));
        }
        if sim.in_recovery {
            sim.in_recovery = false;
            sim.timeline_id += 1;
            sim.events.push("promote".to_string());
        }
        Ok(())
    }

    async fn rewind(&self, upstream: &UpstreamNode) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.running {
            return Err(DatabaseControlError(
                "cannot rewind a running server".to_string(),
            ));
        }
        sim.in_recovery = true;
        sim.events.push(format!("rewind:{}", upstream.host));
        Ok(())
    }

    async fn base_backup(&self, upstream: &UpstreamNode) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.data_directory_exists = true;
        sim.in_recovery = true;
        sim.database_created = true;
        if sim.system_identifier == 0 {
            sim.system_identifier = 7_000_000_000_000_000_001;
        }
        sim.events.push(format!("base_backup:{}", upstream.host));
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), DatabaseControlError> {
        self.inner.lock().unwrap().events.push("checkpoint".to_string());
        Ok(())
    }

    async fn identify_system(
        &self,
        upstream: &UpstreamNode,
    ) -> Result<DatabaseMetadata, DatabaseControlError> {
        let sim = self.inner.lock().unwrap();
        Ok(DatabaseMetadata {
            system_identifier: sim.system_identifier,
            pg_control_version: 1300,
            catalog_version_no: 202307071,
            timeline_id: sim.timeline_id,
            port: upstream.port,
        })
    }

    async fn metadata(&self) -> Result<DatabaseMetadata, DatabaseControlError> {
        let sim = self.inner.lock().unwrap();
        if !sim.data_directory_exists {
            return Err(DatabaseControlError("no data directory".to_string()));
        }
        Ok(DatabaseMetadata {
            system_identifier: sim.system_identifier,
            pg_control_version: 1300,
            catalog_version_no: 202307071,
            timeline_id: sim.timeline_id,
            port: sim.port,
        })
    }

    async fn setup_standby_mode(
        &self,
        upstream: Option<&UpstreamNode>,
    ) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        match upstream {
            Some(node) => sim.events.push(format!("standby_mode:{}", node.host)),
            None => sim.events.push("standby_mode:none".to_string()),
        }
        sim.standby_upstream = Some(upstream.cloned());
        sim.in_recovery = true;
        Ok(())
    }

    async fn cleanup_standby_mode(&self) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.standby_upstream = None;
        sim.events.push("cleanup_standby_mode".to_string());
        Ok(())
    }

    async fn fetch_wal(
        &self,
        upstream: &UpstreamNode,
        target: Lsn,
    ) -> Result<(), DatabaseControlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.current_lsn = sim.current_lsn.max(target);
        sim.events.push(format!("fetch_wal:{}:{}", upstream.host, target));
        Ok(())
    }
}

#[async_trait::async_trait]
impl SqlClient for FakePostgres {
    async fn is_in_recovery(&self) -> Result<bool, SqlError> {
        let sim = self.inner.lock().unwrap();
        if !sim.running {
            return Err(SqlError("server is not running".to_string()));
        }
        Ok(sim.in_recovery)
    }

    async fn replication_status(&self) -> Result<ReplicationStatus, SqlError> {
        let sim = self.inner.lock().unwrap();
        if !sim.running {
            return Err(SqlError("server is not running".to_string()));
        }
        Ok(ReplicationStatus {
            current_lsn: sim.current_lsn,
            sync_state: if sim.in_recovery {
                "async".to_string()
            } else {
                String::new()
            },
            is_in_recovery: sim.in_recovery,
            connected_standbys: sim.connected_standbys.clone(),
        })
    }

    async fn ensure_replication_slot(&self, slot_name: &str) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.slots.insert(slot_name.to_string()) {
            sim.events.push(format!("create_slot:{}", slot_name));
        }
        Ok(())
    }

    async fn drop_replication_slot(&self, slot_name: &str) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.slots.remove(slot_name) {
            sim.events.push(format!("drop_slot:{}", slot_name));
        }
        Ok(())
    }

    async fn list_replication_slots(&self) -> Result<Vec<String>, SqlError> {
        Ok(self.inner.lock().unwrap().slots.iter().cloned().collect())
    }

    async fn set_synchronous_standby_names(&self, expression: &str) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.sync_standby_names = Some(expression.to_string());
        sim.events.push(format!("sync_standby_names:{}", expression));
        Ok(())
    }

    async fn disable_synchronous_replication(&self) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.sync_standby_names = None;
        sim.events.push("disable_sync_replication".to_string());
        Ok(())
    }

    async fn set_default_transaction_read_only(&self, read_only: bool) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        sim.read_only = read_only;
        sim.events.push(format!("read_only:{}", read_only));
        Ok(())
    }

    async fn ensure_replication_user(&self, username: &str) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.replication_users.insert(username.to_string()) {
            sim.events.push(format!("create_user:{}", username));
        }
        Ok(())
    }

    async fn ensure_replication_access(&self, host: &str) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        if sim.access_rules.insert(host.to_string()) {
            sim.events.push(format!("grant_access:{}", host));
        }
        Ok(())
    }

    async fn ensure_database_and_extensions(&self) -> Result<(), SqlError> {
        let mut sim = self.inner.lock().unwrap();
        if !sim.database_created {
            sim.database_created = true;
            sim.events.push("create_database".to_string());
        }
        Ok(())
    }

    async fn apply_baseline_settings(&self) -> Result<(), SqlError> {
        self.inner
            .lock()
            .unwrap()
            .events
            .push("apply_baseline_settings".to_string());
        Ok(())
    }

    async fn verify_baseline_settings(&self) -> Result<(), SqlError> {
        Ok(())
    }
}
