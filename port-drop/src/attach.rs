use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

use aya::programs::XdpFlags;
use clap::ValueEnum;
use log::{info, warn};

use crate::collection::{Collection, Detach};
use crate::error::{AttachFailure, ControlError};
use crate::iface::Interface;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    /// Generic XDP, works on every driver.
    #[default]
    Skb,
    Driver,
    Hw,
}

impl XdpMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}

impl fmt::Display for XdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XdpMode::Skb => "skb",
            XdpMode::Driver => "driver",
            XdpMode::Hw => "hw",
        };
        f.write_str(name)
    }
}

/// Hands out attachments and refuses a second XDP attachment on an interface
/// this process already holds.
#[derive(Clone, Debug, Default)]
pub struct AttachmentManager {
    active: Arc<Mutex<HashSet<u32>>>,
}

impl AttachmentManager {
    pub fn attach<C: Collection>(
        &self,
        collection: &mut C,
        program: &str,
        iface: &Interface,
        mode: XdpMode,
    ) -> Result<AttachmentHandle<C::Link>, ControlError> {
        let attach_err = |source| ControlError::Attach {
            program: program.to_owned(),
            ifindex: iface.index,
            source,
        };

        let mut active = self.active.lock().expect("attachment registry mutex poisoned");
        if active.contains(&iface.index) {
            return Err(attach_err(AttachFailure::AlreadyAttached(iface.index)));
        }
        let link = collection
            .attach_xdp(program, iface.index, mode)
            .map_err(attach_err)?;
        active.insert(iface.index);

        info!("attached {program} to {iface} in {mode} mode");
        Ok(AttachmentHandle {
            link: Some(link),
            program: program.to_owned(),
            iface: iface.clone(),
            registry: Arc::clone(&self.active),
        })
    }

    #[cfg(test)]
    pub fn is_attached(&self, ifindex: u32) -> bool {
        self.active
            .lock()
            .expect("attachment registry mutex poisoned")
            .contains(&ifindex)
    }
}

/// One program bound to one interface. Released exactly once: by `detach`
/// or, failing that, when the handle is dropped.
#[derive(Debug)]
pub struct AttachmentHandle<L: Detach> {
    link: Option<L>,
    program: String,
    iface: Interface,
    registry: Arc<Mutex<HashSet<u32>>>,
}

impl<L: Detach> AttachmentHandle<L> {
    pub fn iface(&self) -> &Interface {
        &self.iface
    }

    #[cfg(test)]
    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Detach the program. Calling this on a detached handle does nothing.
    ///
    /// The link is consumed even when the kernel refuses the detach, but the
    /// interface then stays claimed in the registry: the program may still be
    /// attached.
    pub fn detach(&mut self) -> Result<(), ControlError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        link.detach().map_err(|source| ControlError::Detach {
            program: self.program.clone(),
            ifindex: self.iface.index,
            source,
        })?;
        self.registry
            .lock()
            .expect("attachment registry mutex poisoned")
            .remove(&self.iface.index);
        info!("detached {} from {}", self.program, self.iface);
        Ok(())
    }
}

impl<L: Detach> Drop for AttachmentHandle<L> {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            warn!("{err}");
        }
    }
}
