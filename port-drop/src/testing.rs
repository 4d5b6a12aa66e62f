//! In-memory stand-in for a loaded eBPF object.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use aya::Pod;
use aya::maps::MapError;
use aya::programs::ProgramError;
use aya::sys::SyscallError;
use port_drop_common::{
    CONTROL_SLOT, DropCounter, MAP_DROP_COUNTER, MAP_PORT_CONFIG, PortConfig, XDP_PROGRAM,
};

use crate::attach::XdpMode;
use crate::collection::{Collection, Detach, TableLayout, pod_bytes, pod_from_bytes};
use crate::error::{AttachFailure, TableAccessError};

struct FakeTable {
    layout: TableLayout,
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

/// Shared with every link the fake hands out, so tests can still observe the
/// kernel side after the collection itself has been moved or dropped.
#[derive(Debug, Default)]
pub struct FakeCounters {
    live: AtomicUsize,
    detached: AtomicUsize,
    writes: AtomicUsize,
    fail_detach: AtomicBool,
}

impl FakeCounters {
    pub fn live_links(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeLink {
    counters: Arc<FakeCounters>,
}

impl Detach for FakeLink {
    fn detach(self) -> Result<(), AttachFailure> {
        if self.counters.fail_detach.load(Ordering::SeqCst) {
            let err = syscall_error("bpf_link_detach", libc::EINVAL);
            return Err(ProgramError::from(err).into());
        }
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.detached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn syscall_error(call: &'static str, errno: i32) -> SyscallError {
    SyscallError {
        call,
        io_error: io::Error::from_raw_os_error(errno),
    }
}

#[derive(Default)]
pub struct FakeCollection {
    tables: Mutex<HashMap<String, FakeTable>>,
    programs: HashSet<String>,
    counters: Arc<FakeCounters>,
    occupied: HashSet<u32>,
    fail_writes: bool,
    // Plays the kernel program: bumps the counter right after every read.
    concurrent_drops: Option<u64>,
}

impl FakeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The layout the port filter object declares.
    pub fn with_port_drop_maps() -> Self {
        Self::new()
            .with_program(XDP_PROGRAM)
            .with_array_table(
                MAP_PORT_CONFIG,
                TableLayout {
                    key_size: 4,
                    value_size: 2,
                },
            )
            .with_array_table(
                MAP_DROP_COUNTER,
                TableLayout {
                    key_size: 4,
                    value_size: 8,
                },
            )
    }

    pub fn with_program(mut self, name: &str) -> Self {
        self.programs.insert(name.to_owned());
        self
    }

    /// Single-slot array, zero filled like a kernel array map.
    pub fn with_array_table(self, name: &str, layout: TableLayout) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            pod_bytes(&CONTROL_SLOT).to_vec(),
            vec![0u8; layout.value_size],
        );
        self.insert_table(name, FakeTable { layout, entries })
    }

    pub fn with_hash_table(self, name: &str, layout: TableLayout) -> Self {
        self.insert_table(
            name,
            FakeTable {
                layout,
                entries: HashMap::new(),
            },
        )
    }

    fn insert_table(self, name: &str, table: FakeTable) -> Self {
        self.tables
            .lock()
            .expect("fake tables mutex poisoned")
            .insert(name.to_owned(), table);
        self
    }

    pub fn set_drop_counter(&mut self, packets: u64) {
        self.raw_store(MAP_DROP_COUNTER, &CONTROL_SLOT, &DropCounter { packets });
    }

    pub fn drop_counter(&self) -> u64 {
        self.raw_load::<_, DropCounter>(MAP_DROP_COUNTER, &CONTROL_SLOT)
            .map(|c| c.packets)
            .unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.raw_load::<_, PortConfig>(MAP_PORT_CONFIG, &CONTROL_SLOT)
            .map(|c| c.port)
            .unwrap_or_default()
    }

    pub fn clear_table(&mut self, name: &str) {
        let mut tables = self.tables.lock().expect("fake tables mutex poisoned");
        if let Some(table) = tables.get_mut(name) {
            table.entries.clear();
        }
    }

    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    /// Every link handed out, now or later, refuses to detach.
    pub fn fail_detaches(&self) {
        self.counters.fail_detach.store(true, Ordering::SeqCst);
    }

    pub fn occupy_interface(&mut self, ifindex: u32) {
        self.occupied.insert(ifindex);
    }

    pub fn drop_concurrently(&mut self, packets_per_read: u64) {
        self.concurrent_drops = Some(packets_per_read);
    }

    pub fn counters(&self) -> Arc<FakeCounters> {
        Arc::clone(&self.counters)
    }

    pub fn writes(&self) -> usize {
        self.counters.writes()
    }

    pub fn live_links(&self) -> usize {
        self.counters.live_links()
    }

    pub fn detach_count(&self) -> usize {
        self.counters.detach_count()
    }

    fn raw_store<K: Pod, V: Pod>(&self, table: &str, key: &K, value: &V) {
        let mut tables = self.tables.lock().expect("fake tables mutex poisoned");
        if let Some(table) = tables.get_mut(table) {
            table
                .entries
                .insert(pod_bytes(key).to_vec(), pod_bytes(value).to_vec());
        }
    }

    fn raw_load<K: Pod, V: Pod>(&self, table: &str, key: &K) -> Option<V> {
        let tables = self.tables.lock().expect("fake tables mutex poisoned");
        let bytes = tables.get(table)?.entries.get(pod_bytes(key))?;
        pod_from_bytes(bytes)
    }
}

fn check_widths<K, V>(layout: TableLayout) -> Result<(), TableAccessError> {
    if size_of::<K>() != layout.key_size {
        return Err(TableAccessError::KeyWidth {
            expected: layout.key_size,
            actual: size_of::<K>(),
        });
    }
    if size_of::<V>() != layout.value_size {
        return Err(TableAccessError::ValueWidth {
            expected: layout.value_size,
            actual: size_of::<V>(),
        });
    }
    Ok(())
}

impl Collection for FakeCollection {
    type Link = FakeLink;

    fn table_layout(&self, name: &str) -> Result<Option<TableLayout>, TableAccessError> {
        Ok(self
            .tables
            .lock()
            .expect("fake tables mutex poisoned")
            .get(name)
            .map(|t| t.layout))
    }

    fn lookup<K: Pod, V: Pod>(&self, table: &str, key: &K) -> Result<Option<V>, TableAccessError> {
        let mut tables = self.tables.lock().expect("fake tables mutex poisoned");
        let fake = tables.get_mut(table).ok_or(TableAccessError::Missing)?;
        check_widths::<K, V>(fake.layout)?;

        let key = pod_bytes(key).to_vec();
        let snapshot = fake.entries.get(&key).and_then(|b| pod_from_bytes::<V>(b));

        let extra = self.concurrent_drops.filter(|_| table == MAP_DROP_COUNTER);
        if let (Some(extra), Some(bytes)) = (extra, fake.entries.get_mut(&key)) {
            let current = pod_from_bytes::<u64>(bytes).unwrap_or_default();
            *bytes = (current + extra).to_ne_bytes().to_vec();
        }
        Ok(snapshot)
    }

    fn update<K: Pod, V: Pod>(
        &mut self,
        table: &str,
        key: &K,
        value: &V,
    ) -> Result<(), TableAccessError> {
        if self.fail_writes {
            let err = syscall_error("bpf_map_update_elem", libc::EBADF);
            return Err(MapError::from(err).into());
        }
        let mut tables = self.tables.lock().expect("fake tables mutex poisoned");
        let fake = tables.get_mut(table).ok_or(TableAccessError::Missing)?;
        check_widths::<K, V>(fake.layout)?;
        fake.entries
            .insert(pod_bytes(key).to_vec(), pod_bytes(value).to_vec());
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn attach_xdp(
        &mut self,
        program: &str,
        ifindex: u32,
        _mode: XdpMode,
    ) -> Result<FakeLink, AttachFailure> {
        if !self.programs.contains(program) {
            return Err(AttachFailure::ProgramNotFound(program.to_owned()));
        }
        if self.occupied.contains(&ifindex) {
            let err = syscall_error("bpf_link_create", libc::EBUSY);
            return Err(ProgramError::from(err).into());
        }
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(FakeLink {
            counters: Arc::clone(&self.counters),
        })
    }
}
