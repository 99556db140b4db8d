//! pulsefeed-refdata: Shared reference data for event enrichment
//!
//! Two periodically-rebuilt directories: the organization directory (email
//! domain -> organization name + IP ranges) and the geo directory
//! (identifier -> coordinate). Both are rebuilt wholesale on refresh and
//! handed to observers as immutable snapshots.

pub mod alert;
pub mod error;
pub mod fetch;
pub mod geo;
pub mod organizations;
pub mod sync;

pub use alert::{Alerter, LogAlerter, NoopAlerter};
pub use error::{DirectoryError, FetchError};
pub use geo::{Coordinate, GeoDirectory, GeoDirectoryController, GeoNamespace, Location};
pub use organizations::{
    IpRangeGroup, Organization, OrganizationDirectory, OrganizationDirectoryController,
};
pub use sync::{GeoObserver, OrganizationsObserver, SyncHandle};
