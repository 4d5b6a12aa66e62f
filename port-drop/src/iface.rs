use std::{ffi::CString, fmt, io};

use crate::error::ControlError;

/// A network interface resolved to its kernel index. Only valid for as long as
/// the interface exists; it is resolved again on every start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn resolve(name: &str) -> Result<Self, ControlError> {
        let not_found = |source| ControlError::InterfaceNotFound {
            name: name.to_owned(),
            source,
        };

        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(not_found(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface names are 1 to {} bytes", libc::IFNAMSIZ - 1),
            )));
        }
        let ifname = CString::new(name).map_err(|err| {
            not_found(io::Error::new(io::ErrorKind::InvalidInput, err))
        })?;

        let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if index == 0 {
            return Err(not_found(io::Error::last_os_error()));
        }

        Ok(Self {
            name: name.to_owned(),
            index,
        })
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ifindex {})", self.name, self.index)
    }
}
