//!
//! # Server link
//!
//! A [`Link`] is one live conversation with the DDE server. It owns the
//! [`Transport`], formats the request items, decodes the replies and lifts the
//! server status codes into [`LinkError`]. The link is built with
//! [`LinkBuilder`] which sets the reply timeouts before connecting:
//!
//! ```
//! use zdde::{Builder, Link, Loopback};
//!
//! let mut link = Link::connect(Loopback::builder().build()?)?;
//! println!("server version: {}", link.version()?);
//! link.close();
//! # Ok::<(), zdde::ZddeError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    protocol::{
        self, FirstOrder, ProtocolError, Request, ServerPaths, SystemData, SystemSettings, Trace,
        TraceMode, IMAGE_SURFACE, OK, REFUSED, TIMED_OUT,
    },
    PupilGrid, RayBatch, TraceColumns, Transport, TransportError,
};

/// Item name of the bulk ray data exchange
const RAY_ARRAY_ITEM: &str = "RayArrayData";

#[derive(Debug, thiserror::Error)]
pub enum LinkBuilderError {
    #[error("cannot open `::zdde::LinkBuilder` toml file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot create `::zdde::LinkBuilder` toml file: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot read `::zdde::LinkBuilder` toml file: {1}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("cannot write `::zdde::LinkBuilder` toml file: {1}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("cannot deserialize `::zdde::LinkBuilder` from toml")]
    Load(#[from] toml::de::Error),
    #[error("cannot serialize `::zdde::LinkBuilder` into toml")]
    Save(#[from] toml::ser::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("transport failure during `{item}`")]
    Transport {
        item: String,
        #[source]
        source: TransportError,
    },
    #[error("cannot decode the `{item}` reply")]
    Protocol {
        item: String,
        #[source]
        source: ProtocolError,
    },
    #[error("the server refused `{item}`")]
    Refused { item: String },
    #[error("the server timed out on `{item}`")]
    TimedOut { item: String },
    #[error("`{item}` failed with status {status}")]
    Status { item: String, status: i32 },
}

fn classify(item: &str, e: TransportError) -> LinkError {
    match e {
        TransportError::TimedOut(_) => LinkError::TimedOut { item: item.into() },
        TransportError::Server(REFUSED) => LinkError::Refused { item: item.into() },
        TransportError::Server(TIMED_OUT) => LinkError::TimedOut { item: item.into() },
        TransportError::Server(status) => LinkError::Status {
            item: item.into(),
            status,
        },
        source => LinkError::Transport {
            item: item.into(),
            source,
        },
    }
}

fn expect_ok(item: &str, status: i32) -> Result<(), LinkError> {
    match status {
        OK => Ok(()),
        REFUSED => Err(LinkError::Refused { item: item.into() }),
        TIMED_OUT => Err(LinkError::TimedOut { item: item.into() }),
        status => Err(LinkError::Status {
            item: item.into(),
            status,
        }),
    }
}

fn decode<T>(item: &str, parsed: Result<T, ProtocolError>) -> Result<T, LinkError> {
    parsed.map_err(|source| LinkError::Protocol {
        item: item.into(),
        source,
    })
}

/// [`Link`] builder
///
/// Default properties:
///  * item reply timeout   : 3000ms
///  * array trace timeout  : 5000ms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBuilder {
    timeout_ms: u64,
    array_timeout_ms: u64,
}
impl Default for LinkBuilder {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            array_timeout_ms: 5000,
        }
    }
}
impl LinkBuilder {
    pub fn new() -> Self {
        Default::default()
    }
    /// Load the link builder from a toml
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LinkBuilderError> {
        let mut file = File::open(&path)
            .map_err(|e| LinkBuilderError::Open(e, path.as_ref().to_path_buf()))?;
        let mut toml = String::new();
        file.read_to_string(&mut toml)
            .map_err(|e| LinkBuilderError::Read(e, path.as_ref().to_path_buf()))?;
        let builder: LinkBuilder = toml::from_str(&toml)?;
        Ok(builder)
    }
    /// Save the link builder to a toml
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LinkBuilderError> {
        let toml = toml::to_string_pretty(self)?;
        let mut file = File::create(&path)
            .map_err(|e| LinkBuilderError::Create(e, path.as_ref().to_path_buf()))?;
        write!(file, "# ::zdde::LinkBuilder\n\n{}", toml)
            .map_err(|e| LinkBuilderError::Write(e, path.as_ref().to_path_buf()))?;
        Ok(())
    }
    /// Sets the reply timeout of the item requests in milliseconds
    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        Self { timeout_ms, ..self }
    }
    /// Sets the reply timeout of the bulk ray exchange in milliseconds
    pub fn array_timeout_ms(self, array_timeout_ms: u64) -> Self {
        Self {
            array_timeout_ms,
            ..self
        }
    }
    /// Opens the conversation and pings the server for its version
    pub fn connect<T: Transport>(self, transport: T) -> Result<Link<T>, LinkError> {
        let mut link = Link {
            transport,
            timeout: Duration::from_millis(self.timeout_ms),
            array_timeout: Duration::from_millis(self.array_timeout_ms),
        };
        let version = link.version()?;
        log::info!("connected to the DDE server, version {}", version);
        Ok(link)
    }
}

/// A live conversation with the DDE server
pub struct Link<T: Transport> {
    transport: T,
    timeout: Duration,
    array_timeout: Duration,
}
impl<T: Transport> Link<T> {
    /// Connects with the default timeouts
    pub fn connect(transport: T) -> Result<Self, LinkError> {
        LinkBuilder::default().connect(transport)
    }
    fn ask(&mut self, req: &Request<'_>) -> Result<(String, String), LinkError> {
        let item = req.to_string();
        let reply = self
            .transport
            .request(&item, self.timeout)
            .map_err(|e| classify(&item, e))?;
        Ok((item, reply))
    }
    fn command(&mut self, req: Request<'_>) -> Result<(), LinkError> {
        let (item, reply) = self.ask(&req)?;
        let status = decode(&item, protocol::parse_int(&reply))?;
        expect_ok(&item, status)
    }
    /// The server version
    pub fn version(&mut self) -> Result<i32, LinkError> {
        let (item, reply) = self.ask(&Request::GetVersion)?;
        decode(&item, protocol::parse_int(&reply))
    }
    /// Loads a lens file into the server
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), LinkError> {
        let path = path.as_ref().to_string_lossy();
        self.command(Request::LoadFile(&path))?;
        log::info!("loaded {}", path);
        Ok(())
    }
    /// Updates the lens held by the server, recomputing pupil positions and
    /// solves
    pub fn get_update(&mut self) -> Result<(), LinkError> {
        self.command(Request::GetUpdate)
    }
    /// Pushes the server lens into the main application, where the array
    /// trace runs
    ///
    /// `update` asks the server to update the lens before pushing it. The
    /// permission is checked first: the push is refused when the application
    /// preferences do not allow extensions to push lenses, see
    /// [`push_lens_permission`](Self::push_lens_permission)
    pub fn push_lens(&mut self, update: bool) -> Result<(), LinkError> {
        let req = Request::PushLens { update };
        if !self.push_lens_permission()? {
            return Err(LinkError::Refused {
                item: req.to_string(),
            });
        }
        self.command(req)?;
        log::debug!("lens pushed");
        Ok(())
    }
    /// Whether the application lets extensions push lenses
    pub fn push_lens_permission(&mut self) -> Result<bool, LinkError> {
        let (item, reply) = self.ask(&Request::PushLensPermission)?;
        Ok(decode(&item, protocol::parse_int(&reply))? != 0)
    }
    /// Replaces the server lens with the default new lens
    pub fn new_lens(&mut self) -> Result<(), LinkError> {
        self.command(Request::NewLens)
    }
    /// The server data folder and lens folder
    pub fn get_path(&mut self) -> Result<ServerPaths, LinkError> {
        let (item, reply) = self.ask(&Request::GetPath)?;
        decode(&item, protocol::parse_path(&reply))
    }
    /// General system data of the server lens
    pub fn get_system(&mut self) -> Result<SystemData, LinkError> {
        let (item, reply) = self.ask(&Request::GetSystem)?;
        decode(&item, protocol::parse_system(&reply))
    }
    /// Updates the system settings, returning the system data as set
    pub fn set_system(&mut self, settings: SystemSettings) -> Result<SystemData, LinkError> {
        let (item, reply) = self.ask(&Request::SetSystem(settings))?;
        decode(&item, protocol::parse_system(&reply))
    }
    /// First order properties of the server lens
    pub fn get_first(&mut self) -> Result<FirstOrder, LinkError> {
        let (item, reply) = self.ask(&Request::GetFirst)?;
        decode(&item, protocol::parse_first(&reply))
    }
    /// Traces a single ray through the server lens
    ///
    /// A failed trace is not a link error: the per-ray outcome is in
    /// [`Trace::error`] and [`Trace::vigcode`]
    #[allow(clippy::too_many_arguments)]
    pub fn get_trace(
        &mut self,
        wave: i32,
        mode: TraceMode,
        surf: i32,
        hx: f64,
        hy: f64,
        px: f64,
        py: f64,
    ) -> Result<Trace, LinkError> {
        let (item, reply) = self.ask(&Request::GetTrace {
            wave,
            mode,
            surf,
            hx,
            hy,
            px,
            py,
        })?;
        decode(&item, protocol::parse_trace(&reply))
    }
    /// Traces a single on-axis real ray through to the image surface
    pub fn trace_pupil(&mut self, wave: i32, px: f64, py: f64) -> Result<Trace, LinkError> {
        self.get_trace(wave, TraceMode::Real, IMAGE_SURFACE, 0.0, 0.0, px, py)
    }
    /// Traces a whole batch in a single exchange, results land back in the
    /// batch records
    ///
    /// The trace runs in the main application, against the lens last pushed
    /// with [`push_lens`](Self::push_lens)
    pub fn array_trace(&mut self, batch: &mut RayBatch) -> Result<(), LinkError> {
        self.transport
            .exchange_rays(batch.records_mut(), self.array_timeout)
            .map_err(|e| classify(RAY_ARRAY_ITEM, e))
    }
    /// Builds a batch over the grid, traces it and unpacks the results into
    /// columns
    pub fn get_trace_array(
        &mut self,
        wave: i32,
        grid: &PupilGrid,
    ) -> Result<TraceColumns, LinkError> {
        let mut batch = RayBatch::from_grid(grid, wave);
        self.array_trace(&mut batch)?;
        Ok(batch.columns())
    }
    /// Ends the conversation
    pub fn close(self) {
        self.transport.terminate();
        log::info!("DDE link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, Loopback, RayRecord};
    use std::{cell::Cell, rc::Rc};

    fn link() -> Link<Loopback> {
        Link::connect(Loopback::builder().build().unwrap()).unwrap()
    }

    #[test]
    fn version_ping() {
        let mut link = link();
        assert!(link.version().unwrap() > 0);
        link.close();
    }

    #[test]
    fn load_unknown_file_is_refused() {
        let mut link = link();
        let err = link.load_file("C:\\nowhere\\No such lens.zmx").unwrap_err();
        assert!(
            matches!(&err, LinkError::Refused { item } if item.starts_with("LoadFile")),
            "{err}"
        );
    }

    #[test]
    fn array_trace_needs_a_pushed_lens() {
        let mut link = link();
        let mut batch = RayBatch::from_grid(&PupilGrid::new(1), 1);
        let err = link.array_trace(&mut batch).unwrap_err();
        assert!(matches!(&err, LinkError::Refused { item } if item == RAY_ARRAY_ITEM));
    }

    #[test]
    fn full_session() {
        let mut link = link();
        let paths = link.get_path().unwrap();
        let file = format!("{}\\Cooke 40 degree field.zmx", paths.lens_dir);
        link.load_file(&file).unwrap();
        link.get_update().unwrap();
        link.push_lens(true).unwrap();

        let trace = link.trace_pupil(1, 0.25, -0.25).unwrap();
        assert!(trace.is_traced());
        let norm = trace.l.hypot(trace.m).hypot(trace.n);
        assert!((norm - 1.0).abs() < 1e-12);

        let grid = PupilGrid::new(1);
        let cols = link.get_trace_array(1, &grid).unwrap();
        assert_eq!(cols.len(), grid.len());
        assert!(cols.error.iter().all(|&e| e == 0));
        link.close();
    }

    #[test]
    fn set_system_echoes_the_settings() {
        let mut link = link();
        let sys = link.get_system().unwrap();
        let mut settings: SystemSettings = sys.into();
        settings.temperature = 25.0;
        let sys = link.set_system(settings).unwrap();
        assert_eq!(sys.temperature, 25.0);
        assert_eq!(sys.unit_code, 0);
    }

    #[test]
    fn builder_to_and_from_toml_file() {
        let path = std::env::temp_dir().join(format!("zdde-link-{}.toml", std::process::id()));
        let builder = LinkBuilder::new().timeout_ms(500).array_timeout_ms(9000);
        builder.save(&path).unwrap();
        let loaded = LinkBuilder::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, builder);
    }

    #[test]
    fn push_can_be_disallowed() {
        let mut link = Link::connect(
            Loopback::builder()
                .push_permission(false)
                .build()
                .unwrap(),
        )
        .unwrap();
        assert!(!link.push_lens_permission().unwrap());
        let err = link.push_lens(false).unwrap_err();
        assert!(matches!(&err, LinkError::Refused { item } if item.starts_with("PushLens")));
    }

    /// Remembers the reply timeout handed to each kind of exchange
    struct Clocked {
        server: Loopback,
        item: Rc<Cell<Option<Duration>>>,
        array: Rc<Cell<Option<Duration>>>,
    }
    impl Transport for Clocked {
        fn request(&mut self, item: &str, timeout: Duration) -> Result<String, TransportError> {
            self.item.set(Some(timeout));
            self.server.request(item, timeout)
        }
        fn exchange_rays(
            &mut self,
            records: &mut [RayRecord],
            timeout: Duration,
        ) -> Result<(), TransportError> {
            self.array.set(Some(timeout));
            self.server.exchange_rays(records, timeout)
        }
    }

    #[test]
    fn builder_timeouts_reach_the_transport() {
        let item = Rc::new(Cell::new(None));
        let array = Rc::new(Cell::new(None));
        let transport = Clocked {
            server: Loopback::builder().build().unwrap(),
            item: Rc::clone(&item),
            array: Rc::clone(&array),
        };
        let mut link = LinkBuilder::new()
            .timeout_ms(1250)
            .array_timeout_ms(8000)
            .connect(transport)
            .unwrap();
        assert_eq!(item.get(), Some(Duration::from_millis(1250)));
        assert_eq!(array.get(), None);

        link.load_file("Cooke 40 degree field.zmx").unwrap();
        link.push_lens(true).unwrap();
        let mut batch = RayBatch::from_grid(&PupilGrid::new(1), 1);
        link.array_trace(&mut batch).unwrap();
        assert_eq!(array.get(), Some(Duration::from_millis(8000)));
        assert_eq!(item.get(), Some(Duration::from_millis(1250)));
    }

    /// Lets the session items through, times out `GetUpdate` and every
    /// bulk exchange
    struct Stalled(Loopback);
    impl Transport for Stalled {
        fn request(&mut self, item: &str, timeout: Duration) -> Result<String, TransportError> {
            if item == "GetUpdate" {
                return Err(TransportError::TimedOut(timeout));
            }
            self.0.request(item, timeout)
        }
        fn exchange_rays(
            &mut self,
            _: &mut [RayRecord],
            _: Duration,
        ) -> Result<(), TransportError> {
            Err(TransportError::Server(TIMED_OUT))
        }
    }

    #[test]
    fn late_replies_classify_as_timeouts() {
        let mut link = Link::connect(Stalled(Loopback::builder().build().unwrap())).unwrap();
        let err = link.get_update().unwrap_err();
        assert!(matches!(&err, LinkError::TimedOut { item } if item == "GetUpdate"));
        let mut batch = RayBatch::from_grid(&PupilGrid::new(1), 1);
        let err = link.array_trace(&mut batch).unwrap_err();
        assert!(matches!(&err, LinkError::TimedOut { item } if item == RAY_ARRAY_ITEM));
    }
}
