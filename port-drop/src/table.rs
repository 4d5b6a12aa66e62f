use std::mem;

use aya::Pod;

use crate::collection::{Collection, TableLayout};
use crate::error::{ControlError, TableAccessError};

/// A named table resolved out of a collection. Holds the declared layout and
/// nothing else: every `get` and `put` goes to the collection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Table {
    name: String,
    layout: TableLayout,
}

impl Table {
    pub fn bind<C: Collection>(collection: &C, name: &str) -> Result<Self, ControlError> {
        let layout = collection
            .table_layout(name)
            .map_err(|source| ControlError::Read {
                table: name.to_owned(),
                source,
            })?
            .ok_or_else(|| ControlError::TableNotFound(name.to_owned()))?;
        Ok(Self {
            name: name.to_owned(),
            layout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    pub fn get<C: Collection, K: Pod, V: Pod>(
        &self,
        collection: &C,
        key: K,
    ) -> Result<V, ControlError> {
        let read_err = |source| ControlError::Read {
            table: self.name.clone(),
            source,
        };
        self.check_widths::<K, V>().map_err(read_err)?;
        collection
            .lookup(&self.name, &key)
            .map_err(read_err)?
            .ok_or_else(|| read_err(TableAccessError::Absent))
    }

    /// Write `value` at `key`. Widths are checked before the collection is
    /// touched, so a rejected write leaves the stored value as it was.
    pub fn put<C: Collection, K: Pod, V: Pod>(
        &self,
        collection: &mut C,
        key: K,
        value: V,
    ) -> Result<(), ControlError> {
        let write_err = |source| ControlError::Write {
            table: self.name.clone(),
            source,
        };
        self.check_widths::<K, V>().map_err(write_err)?;
        collection
            .update(&self.name, &key, &value)
            .map_err(write_err)
    }

    fn check_widths<K, V>(&self) -> Result<(), TableAccessError> {
        let key_size = mem::size_of::<K>();
        if key_size != self.layout.key_size {
            return Err(TableAccessError::KeyWidth {
                expected: self.layout.key_size,
                actual: key_size,
            });
        }
        let value_size = mem::size_of::<V>();
        if value_size != self.layout.value_size {
            return Err(TableAccessError::ValueWidth {
                expected: self.layout.value_size,
                actual: value_size,
            });
        }
        Ok(())
    }
}
