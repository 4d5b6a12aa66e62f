use std::{io, mem, path::Path};

use aya::maps::{Array, HashMap, Map, MapData, MapError};
use aya::programs::links::Link;
use aya::programs::xdp::XdpLink;
use aya::programs::{Program, Xdp};
use aya::{Ebpf, EbpfLoader, Pod};
use log::{debug, info};

use crate::attach::XdpMode;
use crate::collection::{Collection, Detach, TableLayout, pod_bytes, pod_from_bytes};
use crate::error::{AttachFailure, ControlError, LoadFailure, TableAccessError};

/// Lift the locked-memory limit so the kernel will pin the object's maps.
pub fn raise_memlock_limit() -> Result<(), ControlError> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(ControlError::Privilege(io::Error::last_os_error()));
    }
    Ok(())
}

/// Raise the memlock limit and load the object at `path`.
pub fn load(path: &Path) -> Result<EbpfCollection, ControlError> {
    raise_memlock_limit()?;
    EbpfCollection::open(path)
}

/// A loaded eBPF object. Dropping it closes every program and map it holds.
pub struct EbpfCollection {
    ebpf: Ebpf,
}

impl EbpfCollection {
    /// Parse the object and load every XDP program it declares. Either all of
    /// them reach the kernel or the partially loaded object is dropped and an
    /// error is returned.
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let load_err = |source: LoadFailure| ControlError::Load {
            path: path.to_path_buf(),
            source,
        };

        let mut ebpf = EbpfLoader::new()
            .load_file(path)
            .map_err(|err| load_err(err.into()))?;

        let mut loaded = 0usize;
        for (name, program) in ebpf.programs_mut() {
            match program {
                Program::Xdp(xdp) => {
                    xdp.load().map_err(|source| {
                        load_err(LoadFailure::Program {
                            name: name.to_owned(),
                            source,
                        })
                    })?;
                    debug!("loaded xdp program {name}");
                    loaded += 1;
                }
                _ => debug!("skipping non-xdp program {name}"),
            }
        }
        if loaded == 0 {
            return Err(load_err(LoadFailure::NoXdpPrograms));
        }

        info!("loaded {} ({loaded} xdp programs)", path.display());
        Ok(Self { ebpf })
    }

    pub fn ebpf_mut(&mut self) -> &mut Ebpf {
        &mut self.ebpf
    }
}

impl Collection for EbpfCollection {
    type Link = XdpLink;

    fn table_layout(&self, name: &str) -> Result<Option<TableLayout>, TableAccessError> {
        let Some(map) = self.ebpf.map(name) else {
            return Ok(None);
        };
        let data = match map {
            Map::Array(data) | Map::HashMap(data) | Map::LruHashMap(data) => data,
            _ => return Err(TableAccessError::UnsupportedType),
        };
        let info = data.info()?;
        Ok(Some(TableLayout {
            key_size: info.key_size() as usize,
            value_size: info.value_size() as usize,
        }))
    }

    fn lookup<K: Pod, V: Pod>(&self, table: &str, key: &K) -> Result<Option<V>, TableAccessError> {
        let map = self.ebpf.map(table).ok_or(TableAccessError::Missing)?;
        let found = match map {
            Map::Array(_) => {
                let index = array_index(key)?;
                Array::<&MapData, V>::try_from(map)?.get(&index, 0)
            }
            Map::HashMap(_) | Map::LruHashMap(_) => {
                HashMap::<&MapData, K, V>::try_from(map)?.get(key, 0)
            }
            _ => return Err(TableAccessError::UnsupportedType),
        };
        match found {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound | MapError::OutOfBounds { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn update<K: Pod, V: Pod>(
        &mut self,
        table: &str,
        key: &K,
        value: &V,
    ) -> Result<(), TableAccessError> {
        let map = self.ebpf.map_mut(table).ok_or(TableAccessError::Missing)?;
        if matches!(map, Map::Array(_)) {
            let index = array_index(key)?;
            let mut array = Array::<&mut MapData, V>::try_from(map)?;
            array.set(index, value, 0)?;
        } else if matches!(map, Map::HashMap(_) | Map::LruHashMap(_)) {
            let mut hash = HashMap::<&mut MapData, K, V>::try_from(map)?;
            hash.insert(key, value, 0)?;
        } else {
            return Err(TableAccessError::UnsupportedType);
        }
        Ok(())
    }

    fn attach_xdp(
        &mut self,
        program: &str,
        ifindex: u32,
        mode: XdpMode,
    ) -> Result<XdpLink, AttachFailure> {
        let xdp: &mut Xdp = self
            .ebpf
            .program_mut(program)
            .ok_or_else(|| AttachFailure::ProgramNotFound(program.to_owned()))?
            .try_into()?;
        let link_id = xdp.attach_to_if_index(ifindex, mode.flags())?;
        Ok(xdp.take_link(link_id)?)
    }
}

impl Detach for XdpLink {
    fn detach(self) -> Result<(), AttachFailure> {
        Link::detach(self).map_err(AttachFailure::from)
    }
}

fn array_index<K: Pod>(key: &K) -> Result<u32, TableAccessError> {
    pod_from_bytes::<u32>(pod_bytes(key)).ok_or(TableAccessError::KeyWidth {
        expected: mem::size_of::<u32>(),
        actual: mem::size_of::<K>(),
    })
}
