//! Device binding.
//!
//! Once a device record exists for a store, the device id in it is
//! authoritative. Initializing with any other (user, device) pair is refused
//! until the record is explicitly cleared; the guard never picks a side.

use tracing::warn;

use crate::error::CryptoError;
use crate::identity::DeviceIdentity;
use crate::persistence::{self, RecordHeader};
use crate::stores::IdentityStore;

/// Outcome of comparing an asserted identity with the persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingCheck {
    /// Nothing persisted under this store name.
    Fresh,
    /// The record belongs to the asserted identity.
    Matches {
        header: RecordHeader,
        record: Vec<u8>,
    },
    Mismatch {
        persisted_user_id: String,
        persisted_device_id: String,
    },
}

pub struct DeviceBindingGuard<'a> {
    store: &'a dyn IdentityStore,
}

impl<'a> DeviceBindingGuard<'a> {
    pub fn new(store: &'a dyn IdentityStore) -> Self {
        Self { store }
    }

    /// Compare `asserted` with whatever is persisted under `store_name`.
    /// Only the record's cleartext header is read.
    pub fn check(
        &self,
        store_name: &str,
        asserted: &DeviceIdentity,
    ) -> Result<BindingCheck, CryptoError> {
        let Some(record) = self.store.load(store_name)? else {
            return Ok(BindingCheck::Fresh);
        };
        let header = persistence::read_record_header(&record)?;
        if header.user_id != asserted.user_id || header.device_id != asserted.device_id {
            warn!(
                store_name,
                persisted_device_id = %header.device_id,
                asserted_device_id = %asserted.device_id,
                "device record belongs to a different device"
            );
            return Ok(BindingCheck::Mismatch {
                persisted_user_id: header.user_id,
                persisted_device_id: header.device_id,
            });
        }
        Ok(BindingCheck::Matches { header, record })
    }

    /// Like [`Self::check`], but a mismatch is an error.
    pub fn enforce(
        &self,
        store_name: &str,
        asserted: &DeviceIdentity,
    ) -> Result<Option<(RecordHeader, Vec<u8>)>, CryptoError> {
        match self.check(store_name, asserted)? {
            BindingCheck::Fresh => Ok(None),
            BindingCheck::Matches { header, record } => Ok(Some((header, record))),
            BindingCheck::Mismatch {
                persisted_device_id,
                ..
            } => Err(CryptoError::DeviceMismatch {
                persisted_device_id,
                asserted_device_id: asserted.device_id.clone(),
            }),
        }
    }
}
