//! Distributed mutual exclusion over an independent quorum of lock members.
//!
//! Each member holds at most one segment per key: a token value with a
//! server-side expiry. A lock is held while a strict majority of members
//! carry the holder's token and the acquisition fit inside the TTL minus a
//! clock-drift allowance. All conditional operations run server-side so no
//! other client can interleave between a read and a write.

use futures::future::join_all;
use redis::aio::ConnectionManager;
use tokio::sync::{mpsc, watch};
use tracing::instrument;
use uuid::Uuid;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{config::LockClusterConfig, error::LockError, handle::OwnedTaskHandle};

/// Reset the expiry only while the key still carries the caller's token.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Compare-and-delete: remove the key only while it carries the caller's
/// token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Strict majority of `members`.
pub(crate) fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Clock-drift allowance subtracted from a lock's validity window.
pub(crate) fn drift(ttl: Duration) -> Duration {
    (ttl / 100).max(Duration::from_millis(1))
}

struct LockMember {
    addr: String,
    conn: ConnectionManager,
}

struct LockClusterInner {
    members: Vec<LockMember>,
}

#[derive(Clone)]
/// Handle to the lock cluster members. Cheap to clone; safe for concurrent
/// use by workers and renewal loops.
pub struct LockCluster {
    inner: Arc<LockClusterInner>,
}

impl LockCluster {
    /// Connect to every configured member.
    pub async fn connect(config: &LockClusterConfig) -> Result<Self, LockError> {
        if config.hosts.is_empty() {
            return Err(LockError::NoMembersConfigured);
        }
        let mut members = Vec::with_capacity(config.hosts.len());
        for host in &config.hosts {
            let client = redis::Client::open(format!("redis://{host}"))?;
            let conn = client.get_connection_manager().await?;
            members.push(LockMember {
                addr: host.clone(),
                conn,
            });
        }
        Ok(Self {
            inner: Arc::new(LockClusterInner { members }),
        })
    }

    pub fn member_count(&self) -> usize {
        self.inner.members.len()
    }

    /// Set `key` to `token` at one member, only if unset there, with a
    /// server-side expiry. A member that is unreachable counts as a refusal.
    async fn acquire_segment(&self, member: usize, key: &str, token: &str, ttl: Duration) -> bool {
        let node = &self.inner.members[member];
        let mut conn = node.conn.clone();
        let reply: Result<Option<String>, _> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                tracing::warn!(member = %node.addr, key, error = %e, "lock member unreachable during acquire");
                false
            }
        }
    }

    async fn renew_segment(&self, member: usize, key: &str, token: &str, ttl: Duration) -> bool {
        let node = &self.inner.members[member];
        let mut conn = node.conn.clone();
        let reply: Result<i64, _> = redis::Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await;
        match reply {
            Ok(renewed) => renewed > 0,
            Err(e) => {
                tracing::warn!(member = %node.addr, key, error = %e, "lock member unreachable during renew");
                false
            }
        }
    }

    async fn release_segment(&self, member: usize, key: &str, token: &str) -> bool {
        let node = &self.inner.members[member];
        let mut conn = node.conn.clone();
        let reply: Result<i64, _> = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        match reply {
            Ok(deleted) => deleted > 0,
            Err(e) => {
                tracing::warn!(member = %node.addr, key, error = %e, "lock member unreachable during release");
                false
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct LockSegment {
    member: usize,
    acquired_at: Instant,
}

/// A quorum lock on a single key.
///
/// `acquire` fans out to every member in parallel and succeeds only with a
/// strict majority inside the drift-adjusted validity window. With
/// `auto_renew` the held segments are refreshed every half TTL until the
/// lock is released or loses its majority.
pub struct DistributedLock {
    cluster: LockCluster,
    key: String,
    ttl: Duration,
    token: String,
    segments: Arc<Mutex<Vec<LockSegment>>>,
    ever_granted: Vec<usize>,
    lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
    renew_stop: Option<mpsc::Sender<()>>,
    renew_task: Option<OwnedTaskHandle>,
}

impl DistributedLock {
    pub fn new(cluster: LockCluster, key: impl Into<String>) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        Self {
            cluster,
            key: key.into(),
            ttl: Duration::from_secs(16),
            token: String::new(),
            segments: Arc::new(Mutex::new(Vec::new())),
            ever_granted: Vec::new(),
            lost_tx,
            lost_rx,
            renew_stop: None,
            renew_task: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a majority of unexpired segments is still held and the
    /// renewal loop has not reported loss.
    pub fn is_active(&self) -> bool {
        if *self.lost_rx.borrow() {
            return false;
        }
        let segments = self.segments.lock().expect("Couldn't lock segment set");
        let live = segments
            .iter()
            .filter(|s| s.acquired_at.elapsed() + drift(self.ttl) < self.ttl)
            .count();
        live >= quorum(self.cluster.member_count())
    }

    /// Receiver that flips to `true` the moment the renewal loop loses the
    /// majority. Never flips for a lock acquired without auto-renew.
    pub(crate) fn subscribe_lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Attempt to take the lock. Never retried internally; on a failed
    /// quorum or an exhausted validity window every partial segment is
    /// released best-effort and `false` is returned.
    #[instrument(name = "lock.acquire", skip(self), fields(key = %self.key))]
    pub async fn acquire(&mut self, auto_renew: bool) -> bool {
        if !self.ever_granted.is_empty() {
            self.release().await;
        }
        self.token = Uuid::new_v4().simple().to_string();
        let (lost_tx, lost_rx) = watch::channel(false);
        self.lost_tx = lost_tx;
        self.lost_rx = lost_rx;

        let members = self.cluster.member_count();
        let start = Instant::now();
        let attempts = (0..members).map(|member| {
            let cluster = self.cluster.clone();
            let key = self.key.clone();
            let token = self.token.clone();
            let ttl = self.ttl;
            async move { (member, cluster.acquire_segment(member, &key, &token, ttl).await) }
        });
        let granted: Vec<usize> = join_all(attempts)
            .await
            .into_iter()
            .filter(|(_, granted)| *granted)
            .map(|(member, _)| member)
            .collect();
        let elapsed = start.elapsed();
        self.ever_granted = granted.clone();

        if granted.len() < quorum(members) || elapsed + drift(self.ttl) >= self.ttl {
            tracing::debug!(
                key = %self.key,
                granted = granted.len(),
                quorum = quorum(members),
                elapsed_ms = elapsed.as_millis() as u64,
                "lock not acquired"
            );
            self.release().await;
            return false;
        }

        *self.segments.lock().expect("Couldn't lock segment set") = granted
            .into_iter()
            .map(|member| LockSegment {
                member,
                acquired_at: start,
            })
            .collect();
        if auto_renew {
            self.spawn_renewal();
        }
        true
    }

    /// Release every segment ever granted in this acquisition, covering
    /// segments believed expired but possibly still held. Succeeds when at
    /// least one member acknowledged the delete; repeat calls return
    /// `false` without side effects.
    #[instrument(name = "lock.release", skip(self), fields(key = %self.key))]
    pub async fn release(&mut self) -> bool {
        self.renew_stop = None;
        if let Some(task) = self.renew_task.take() {
            let _ = task.join().await;
        }
        self.segments
            .lock()
            .expect("Couldn't lock segment set")
            .clear();
        let granted = std::mem::take(&mut self.ever_granted);
        if granted.is_empty() {
            return false;
        }
        let releases = granted.into_iter().map(|member| {
            let cluster = self.cluster.clone();
            let key = self.key.clone();
            let token = self.token.clone();
            async move { cluster.release_segment(member, &key, &token).await }
        });
        join_all(releases).await.into_iter().any(|released| released)
    }

    fn spawn_renewal(&mut self) {
        let lost_tx = self.lost_tx.clone();
        let cluster = self.cluster.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        let ttl = self.ttl;
        let segments = Arc::clone(&self.segments);
        let quorum = quorum(cluster.member_count());
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(ttl / 2) => {
                        let held: Vec<usize> = segments
                            .lock()
                            .expect("Couldn't lock segment set")
                            .iter()
                            .map(|s| s.member)
                            .collect();
                        let renewed_at = Instant::now();
                        let renewals = held.into_iter().map(|member| {
                            let cluster = cluster.clone();
                            let key = key.clone();
                            let token = token.clone();
                            async move {
                                (member, cluster.renew_segment(member, &key, &token, ttl).await)
                            }
                        });
                        let surviving: Vec<LockSegment> = join_all(renewals)
                            .await
                            .into_iter()
                            .filter(|(_, renewed)| *renewed)
                            .map(|(member, _)| LockSegment {
                                member,
                                acquired_at: renewed_at,
                            })
                            .collect();
                        let held_now = surviving.len();
                        *segments.lock().expect("Couldn't lock segment set") = surviving;
                        if held_now < quorum {
                            tracing::warn!(key = %key, held = held_now, quorum, "lock lost majority during renewal");
                            let _ = lost_tx.send(true);
                            break;
                        }
                    }
                }
            }
        });
        self.renew_stop = Some(stop_tx);
        self.renew_task = Some(OwnedTaskHandle::new(handle));
    }
}
