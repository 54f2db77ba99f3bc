pub mod audit;
pub mod config;
pub mod convert;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod placement;
pub mod reconcile;
pub mod registry;
pub mod unpack;
pub mod util;
pub mod warn;
