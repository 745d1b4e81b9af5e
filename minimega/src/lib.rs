//! Distributed control plane for experiment fabrics
//!
//! minimega runs one daemon per cluster node. The daemons form a peer
//! mesh and the whole cluster is driven as one machine: commands issued
//! against any node are routed, executed everywhere they apply, and
//! their results streamed back. This crate re-exports the component
//! layers and carries the daemon binary.

#[doc(inline)]
pub use minimega_meshage as meshage;

#[doc(inline)]
pub use minimega_minicli as minicli;

#[doc(inline)]
pub use minimega_iomeshage as iomeshage;

#[doc(inline)]
pub use minimega_ron as ron;

#[doc(inline)]
pub use minimega_ranges as ranges;

#[doc(inline)]
pub use minimega_plumber as plumber;

#[doc(inline)]
pub use minimega_tunnel as tunnel;

#[doc(inline)]
pub use minimega_codec as codec;

pub mod fanout;
pub mod handlers;

/// Mesh demux tag for fanned-out CLI commands
pub const CLI_TAG: meshage::Tag = 1;
