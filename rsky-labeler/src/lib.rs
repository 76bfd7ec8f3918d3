pub static APP_USER_AGENT: &str = concat!(
    env!("CARGO_PKG_HOMEPAGE"),
    "@",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
);

pub mod config;
pub mod error;
pub mod label;
pub mod server;
pub mod signer;
pub mod store;
pub mod subscription;
pub mod validation;

pub use config::LabelerConfig;
pub use error::{InitError, LabelerError};
pub use label::{LabelData, SignedLabel, UnsignedLabel};
pub use server::{CreatedLabel, LabelWarning, LabelerServer};
pub use signer::{Secp256k1Signer, Signer};
pub use store::{
    FindOptions, LabelFilter, LabelStore, MemoryLabelStore, PostgresLabelStore, SortOrder,
    StoredLabel,
};
