//! Licensing domain module (event-sourced).
//!
//! Software licenses issued to a holder for a product, with seat counts, renewals,
//! suspension and revocation. Pure domain logic: no IO, no storage.

pub mod license;

pub use license::{
    ChangeSeats, IssueLicense, License, LicenseCommand, LicenseEvent, LicenseIssued,
    LicenseReinstated, LicenseRenewed, LicenseRevoked, LicenseSnapshot, LicenseStatus,
    LicenseSuspended, ReinstateLicense, RenewLicense, RevokeLicense, SeatsChanged,
    SuspendLicense,
};
