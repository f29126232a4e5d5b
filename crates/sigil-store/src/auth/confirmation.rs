//! Stored confirms, one per partner.

use sigil_proto::PartnerId;

use super::{AuthStore, AuthStoreError, Confirmation, Result, partner_key};
use crate::storage::Storage;

const CONFIRMATION_PREFIX: &str = "Confirmation/";
const CONFIRMATION_VERSION: u64 = 0;

impl<S: Storage> AuthStore<S> {
    /// Keep the confirm sent to `partner` so a duplicate request can be
    /// answered with the same bytes. Replaces any earlier confirm.
    pub fn store_confirmation(&self, partner: &PartnerId, confirmation: &Confirmation) -> Result<()> {
        let key = partner_key(CONFIRMATION_PREFIX, partner);
        self.storage.set_record(&key, CONFIRMATION_VERSION, confirmation)?;
        Ok(())
    }

    /// The last confirm sent to `partner`.
    ///
    /// # Errors
    ///
    /// - `AuthStoreError::NoConfirmation` if none was stored
    pub fn load_confirmation(&self, partner: &PartnerId) -> Result<Confirmation> {
        let key = partner_key(CONFIRMATION_PREFIX, partner);
        self.storage
            .get_record(&key, CONFIRMATION_VERSION)?
            .ok_or(AuthStoreError::NoConfirmation { partner: *partner })
    }

    /// Drop the stored confirm for `partner`, if any.
    pub fn delete_confirmation(&self, partner: &PartnerId) -> Result<()> {
        self.storage.delete(&partner_key(CONFIRMATION_PREFIX, partner))?;
        Ok(())
    }
}
