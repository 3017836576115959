//! Process tree tracking through /proc.
//!
//! A run is the child's process group plus every descendant reachable through
//! the parent chain, including ones that moved to their own group or session.
//! Identities pair the pid with its start time so a recycled pid is never
//! mistaken for a tracked process.
//!
//! A descendant whose parent exits before a scan sees it loses that chain.
//! When the service is a child subreaper such orphans are re-parented to it,
//! and a run adopts the ones no other run has claimed.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Stable identity of a process: pid plus start time in clock ticks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub start_ticks: u64,
}

impl ProcessIdentity {
    pub fn capture(pid: i32) -> Option<Self> {
        read_stat(pid).map(|stat| stat.identity())
    }

    /// Still running and not recycled. Zombies count as gone.
    pub fn is_alive(&self) -> bool {
        match read_stat(self.pid) {
            Some(stat) => stat.start_ticks == self.start_ticks && !stat.is_dead(),
            None => false,
        }
    }
}

/// The fields of /proc/<pid>/stat the supervisor uses
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    pub start_ticks: u64,
    pub rss_pages: u64,
}

impl ProcStat {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_ticks: self.start_ticks,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }

    /// Parse one stat line. The command name may contain spaces and
    /// parentheses, so fields are counted from the last ')'.
    pub fn parse(pid: i32, content: &str) -> Option<Self> {
        let close = content.rfind(')')?;
        let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
        // fields[0] is field 3 (state) in proc(5) numbering
        let field = |n: usize| -> Option<u64> { fields.get(n - 3)?.parse::<u64>().ok() };

        Some(ProcStat {
            pid,
            state: fields.first()?.chars().next()?,
            ppid: fields.get(1)?.parse::<i32>().ok()?,
            pgrp: fields.get(2)?.parse::<i32>().ok()?,
            utime: field(14)?,
            stime: field(15)?,
            cutime: fields.get(16 - 3)?.parse::<i64>().ok()?.max(0) as u64,
            cstime: fields.get(17 - 3)?.parse::<i64>().ok()?.max(0) as u64,
            start_ticks: field(22)?,
            rss_pages: fields.get(24 - 3)?.parse::<i64>().ok()?.max(0) as u64,
        })
    }
}

pub fn read_stat(pid: i32) -> Option<ProcStat> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    ProcStat::parse(pid, &content)
}

/// Snapshot of every process visible in /proc
pub fn scan_processes() -> Vec<ProcStat> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to scan /proc: {}", e);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_stat)
        .collect()
}

pub fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Whether orphaned descendants are re-parented to this process
pub fn is_subreaper() -> bool {
    nix::sys::prctl::get_child_subreaper().unwrap_or(false)
}

/// Orphans are re-parented to the process, not to an executor
static SERVICE_REGISTRY: once_cell::sync::Lazy<Arc<ProcessRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(ProcessRegistry::new()));

/// Processes claimed by live runs and by the service's own helpers.
///
/// Every direct child is registered under the lock before any run can scan,
/// so an orphan is only ever adopted by one run and a sibling's root never.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    owned: Mutex<HashSet<ProcessIdentity>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every executor in this process
    pub fn global() -> Arc<Self> {
        Arc::clone(&SERVICE_REGISTRY)
    }

    pub fn release(&self, id: &ProcessIdentity) {
        self.lock().remove(id);
    }

    pub fn lock(&self) -> MutexGuard<'_, HashSet<ProcessIdentity>> {
        self.owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Adoption {
    registry: Arc<ProcessRegistry>,
    service_pid: i32,
}

/// Aggregate usage of a tracked group at one instant
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupSample {
    pub live_processes: usize,
    pub rss_bytes: u64,
    pub cpu_time: Duration,
}

/// Tracks one run's processes across samples.
pub struct ProcessTracker {
    root: ProcessIdentity,
    pgid: i32,
    known: HashMap<i32, ProcessIdentity>,
    peak_rss_bytes: u64,
    cpu_ticks: u64,
    ticks_per_second: u64,
    page_size: u64,
    adoption: Option<Adoption>,
}

impl ProcessTracker {
    pub fn new(root_pid: i32) -> Self {
        let root = ProcessIdentity::capture(root_pid).unwrap_or(ProcessIdentity {
            pid: root_pid,
            start_ticks: 0,
        });
        let mut known = HashMap::new();
        known.insert(root.pid, root);
        Self {
            root,
            // the child is its own group leader
            pgid: root_pid,
            known,
            peak_rss_bytes: 0,
            cpu_ticks: 0,
            ticks_per_second: clock_ticks_per_second(),
            page_size: page_size(),
            adoption: None,
        }
    }

    /// Adopt orphans re-parented to this process that `registry` says are
    /// nobody else's. The caller has already registered the root.
    pub fn with_adoption(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.adoption = Some(Adoption {
            registry,
            service_pid: std::process::id() as i32,
        });
        self
    }

    /// Drop this run's claims, except processes that are still running.
    pub fn release_claims(&self, keep: &[ProcessIdentity]) {
        if let Some(adoption) = &self.adoption {
            let mut owned = adoption.registry.lock();
            for id in self.known.values().chain(std::iter::once(&self.root)) {
                if !keep.contains(id) {
                    owned.remove(id);
                }
            }
        }
    }

    pub fn root(&self) -> ProcessIdentity {
        self.root
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn peak_rss_bytes(&self) -> u64 {
        self.peak_rss_bytes
    }

    pub fn known(&self) -> impl Iterator<Item = &ProcessIdentity> {
        self.known.values()
    }

    /// Current members of the run from one /proc scan
    fn members(&mut self, table: &[ProcStat]) -> Vec<ProcStat> {
        let by_pid: HashMap<i32, &ProcStat> = table.iter().map(|s| (s.pid, s)).collect();

        // Drop identities whose pid was recycled
        self.known.retain(|pid, id| match by_pid.get(pid) {
            Some(stat) => stat.start_ticks == id.start_ticks,
            None => true,
        });

        self.adopt_orphans(table);

        let mut changed = true;
        while changed {
            changed = false;
            for stat in table {
                if self.known.contains_key(&stat.pid) {
                    continue;
                }
                let in_group = stat.pgrp == self.pgid;
                let parent_tracked = self
                    .known
                    .get(&stat.ppid)
                    .and_then(|parent| by_pid.get(&parent.pid).map(|p| p.start_ticks == parent.start_ticks))
                    .unwrap_or(false);
                if in_group || parent_tracked {
                    self.known.insert(stat.pid, stat.identity());
                    changed = true;
                }
            }
        }

        self.known
            .values()
            .filter_map(|id| by_pid.get(&id.pid).copied())
            .cloned()
            .collect()
    }

    /// Claim unowned orphans of the service that started after this run did.
    ///
    /// Another run's root, or anything still in another run's process group,
    /// is owned by that run.
    fn adopt_orphans(&mut self, table: &[ProcStat]) {
        let Some(adoption) = &self.adoption else {
            return;
        };
        let mut owned = adoption.registry.lock();
        for stat in table {
            if stat.ppid != adoption.service_pid
                || stat.start_ticks < self.root.start_ticks
                || self.known.contains_key(&stat.pid)
            {
                continue;
            }
            let identity = stat.identity();
            if owned.contains(&identity) || owned.iter().any(|id| id.pid == stat.pgrp) {
                continue;
            }
            log::debug!(
                "Run rooted at {} adopted orphan {} (session leader {})",
                self.root.pid,
                stat.pid,
                stat.pgrp == stat.pid
            );
            owned.insert(identity);
            self.known.insert(stat.pid, identity);
        }
    }

    /// Scan /proc and fold the run's current usage into the tracker.
    ///
    /// CPU is the sum over live members plus what the root has collected from
    /// reaped children; it never decreases between samples.
    pub fn sample(&mut self) -> GroupSample {
        let table = scan_processes();
        self.sample_from(&table)
    }

    pub fn sample_from(&mut self, table: &[ProcStat]) -> GroupSample {
        let members = self.members(table);

        let mut rss_pages = 0u64;
        let mut ticks = 0u64;
        let mut live = 0usize;
        for stat in &members {
            ticks += stat.utime + stat.stime;
            if stat.pid == self.root.pid {
                ticks += stat.cutime + stat.cstime;
            }
            if !stat.is_dead() {
                live += 1;
                rss_pages += stat.rss_pages;
            }
        }

        let rss_bytes = rss_pages.saturating_mul(self.page_size);
        self.peak_rss_bytes = self.peak_rss_bytes.max(rss_bytes);
        self.cpu_ticks = self.cpu_ticks.max(ticks);

        GroupSample {
            live_processes: live,
            rss_bytes,
            cpu_time: Duration::from_millis(self.cpu_ticks * 1000 / self.ticks_per_second.max(1)),
        }
    }

    /// Tracked processes that are still running
    pub fn survivors(&mut self) -> Vec<ProcessIdentity> {
        let table = scan_processes();
        self.members(&table)
            .into_iter()
            .filter(|stat| !stat.is_dead())
            .map(|stat| stat.identity())
            .collect()
    }

    /// Reap zombies that were reparented to this process (subreaper mode).
    ///
    /// Only waits on specific tracked pids so concurrent runs never steal
    /// each other's children. The root is reaped by the supervisor itself.
    pub fn reap_orphans(&mut self) -> usize {
        let me = std::process::id() as i32;
        let table = scan_processes();
        let mut reaped = 0;
        for stat in self.members(&table) {
            if stat.pid == self.root.pid || stat.ppid != me || !stat.is_dead() {
                continue;
            }
            let mut status = 0;
            // SAFETY: waitpid on a specific pid we are the parent of.
            let rc = unsafe { libc::waitpid(stat.pid, &mut status, libc::WNOHANG) };
            if rc == stat.pid {
                reaped += 1;
            }
        }
        reaped
    }
}
