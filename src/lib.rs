//!
//! # Zemax DDE wrapper crate
//!
//! The crate drives the DDE automation server of the Zemax optical design
//! application: lens files are loaded and pushed, rays are traced one by
//! one with text items or in bulk with the ray data record exchange, and
//! the alternative tracing paths are checked against each other for
//! agreement ([`ParityCheck`]) and compared for throughput ([`SpeedTest`]).
//!
//! The IPC layer is abstracted by the [`Transport`] trait; the crate ships
//! the in-process [`Loopback`] server so the session below also runs
//! without a Windows desktop:
//! ```rust
//! use zdde::{Builder, Link, Loopback, ParityCheck, PupilGrid};
//!
//! let mut link = Link::connect(Loopback::builder().build()?)?;
//! let paths = link.get_path()?;
//! link.load_file(format!("{}\\Cooke 40 degree field.zmx", paths.lens_dir))?;
//! link.get_update()?;
//! link.push_lens(true)?;
//!
//! let report = ParityCheck::new(PupilGrid::with_ray_target(81)).run(&mut link)?;
//! assert_eq!(report.max_deviation(), 0.0);
//! link.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//! Components with settings are created with the builder associated to
//! each component, e.g. [`SpeedTest::builder()`](SpeedTest::builder).

pub mod batch;
pub mod error;
pub mod grid;
pub mod link;
pub mod loopback;
pub mod parity;
pub mod protocol;
pub mod speed;
pub mod transport;

#[doc(inline)]
pub use self::batch::{BatchError, RayBatch, RayFailures, RayRecord, TraceColumns};
#[doc(inline)]
pub use self::error::ZddeError;
#[doc(inline)]
pub use self::grid::PupilGrid;
#[doc(inline)]
pub use self::link::{Link, LinkBuilder, LinkBuilderError, LinkError};
#[doc(inline)]
pub use self::loopback::{LensDesign, Loopback, LoopbackBuilder, LoopbackError};
#[doc(inline)]
pub use self::parity::{
    Field, FieldDeviations, ParityCheck, ParityError, ParityReport, TracePath,
};
#[doc(inline)]
pub use self::protocol::{
    FirstOrder, ProtocolError, ServerPaths, SystemData, SystemSettings, Trace, TraceMode,
};
#[doc(inline)]
pub use self::speed::{
    best_of_n_average, SpeedError, SpeedReport, SpeedRow, SpeedTest, SpeedTestBuilder,
    SpeedTestBuilderError,
};
#[doc(inline)]
pub use self::transport::{Transport, TransportError};

pub type Result<T> = std::result::Result<T, ZddeError>;

/// Common interface to the component builders
pub trait Builder: Default {
    type Component;
    /// Creates a new builder with the default properties
    fn new() -> Self {
        Default::default()
    }
    /// Builds the component
    fn build(self) -> Result<Self::Component>;
}
