use std::{io, path::PathBuf};

use aya::{EbpfError, maps::MapError, programs::ProgramError};
use thiserror::Error;

/// Failures of the control plane, one variant per resource it manages.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to raise RLIMIT_MEMLOCK (are you root?)")]
    Privilege(#[source] io::Error),

    #[error("failed to load eBPF object {}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: LoadFailure,
    },

    #[error("table {0} not found in eBPF object")]
    TableNotFound(String),

    #[error("interface {name} not found")]
    InterfaceNotFound {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach program {program} to ifindex {ifindex}")]
    Attach {
        program: String,
        ifindex: u32,
        #[source]
        source: AttachFailure,
    },

    #[error("failed to detach program {program} from ifindex {ifindex}")]
    Detach {
        program: String,
        ifindex: u32,
        #[source]
        source: AttachFailure,
    },

    #[error("failed to read table {table}")]
    Read {
        table: String,
        #[source]
        source: TableAccessError,
    },

    #[error("failed to write table {table}")]
    Write {
        table: String,
        #[source]
        source: TableAccessError,
    },
}

impl ControlError {
    /// True for a read that found no value at the requested key.
    pub fn is_absent_key(&self) -> bool {
        matches!(
            self,
            ControlError::Read {
                source: TableAccessError::Absent,
                ..
            }
        )
    }
}

#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error(transparent)]
    Object(#[from] EbpfError),

    #[error("kernel rejected program {name}")]
    Program {
        name: String,
        #[source]
        source: ProgramError,
    },

    #[error("object declares no XDP programs")]
    NoXdpPrograms,
}

#[derive(Debug, Error)]
pub enum TableAccessError {
    #[error("key is absent")]
    Absent,

    #[error("key is {actual} bytes but the table declares {expected}")]
    KeyWidth { expected: usize, actual: usize },

    #[error("value is {actual} bytes but the table declares {expected}")]
    ValueWidth { expected: usize, actual: usize },

    #[error("table is missing from the collection")]
    Missing,

    #[error("unsupported map type for table access")]
    UnsupportedType,

    #[error(transparent)]
    Map(#[from] MapError),
}

#[derive(Debug, Error)]
pub enum AttachFailure {
    #[error("program {0} not found in eBPF object")]
    ProgramNotFound(String),

    #[error("ifindex {0} already has an XDP program attached by this process")]
    AlreadyAttached(u32),

    #[error(transparent)]
    Program(#[from] ProgramError),
}
