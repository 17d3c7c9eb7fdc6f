//!
//! # DDE item grammar
//!
//! Requests to the Zemax DDE server are plain text items, replies are plain
//! text too, most of them comma separated numbers. This module holds the item
//! vocabulary ([`Request`]) and the reply codecs for every exchange the crate
//! performs. Both sides of the conversation live here: the client formats a
//! [`Request`] with `Display` and parses the reply with the `parse_*`
//! functions, while a server (see [`Loopback`](crate::Loopback)) parses the
//! item with [`Request::parse`] and formats the replies with the `Display`
//! implementations of the data types.
//!
//! Numbers are written with Rust shortest round trip formatting so that a
//! value parsed back from the wire is the value that was sent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request completed
pub const OK: i32 = 0;
/// Request refused by the server, e.g. pushing a lens without permission
pub const REFUSED: i32 = -999;
/// Request timed out
pub const TIMED_OUT: i32 = -998;
/// Request was not understood
pub const INVALID: i32 = -1;

/// Surface code addressing the image surface
pub const IMAGE_SURFACE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty reply from the server")]
    EmptyReply,
    #[error("`{reply}` is not a `{what}` reply: expected {expected} comma separated fields, found {found}")]
    FieldCount {
        what: &'static str,
        reply: String,
        expected: usize,
        found: usize,
    },
    #[error("cannot parse integer field in `{0}`")]
    Int(String, #[source] std::num::ParseIntError),
    #[error("cannot parse float field in `{0}`")]
    Float(String, #[source] std::num::ParseFloatError),
    #[error("unknown request item `{0}`")]
    UnknownItem(String),
    #[error("unknown ray trace mode code `{0}`")]
    UnknownMode(i32),
}

/// Ray tracing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TraceMode {
    /// Real ray aimed at the entrance pupil
    #[default]
    Real,
    /// Paraxial ray
    Paraxial,
}
impl TraceMode {
    /// Wire code of the mode
    pub fn code(self) -> i32 {
        match self {
            TraceMode::Real => 0,
            TraceMode::Paraxial => 1,
        }
    }
    pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(TraceMode::Real),
            1 => Ok(TraceMode::Paraxial),
            other => Err(ProtocolError::UnknownMode(other)),
        }
    }
}

/// Items of the DDE conversation
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    GetVersion,
    LoadFile(&'a str),
    GetUpdate,
    PushLens { update: bool },
    PushLensPermission,
    NewLens,
    GetPath,
    GetSystem,
    SetSystem(SystemSettings),
    GetFirst,
    GetTrace {
        wave: i32,
        mode: TraceMode,
        surf: i32,
        hx: f64,
        hy: f64,
        px: f64,
        py: f64,
    },
}
impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::GetVersion => write!(f, "GetVersion"),
            Request::LoadFile(path) => write!(f, "LoadFile,{}", path),
            Request::GetUpdate => write!(f, "GetUpdate"),
            Request::PushLens { update } => write!(f, "PushLens,{}", i32::from(*update)),
            Request::PushLensPermission => write!(f, "PushLensPermission"),
            Request::NewLens => write!(f, "NewLens"),
            Request::GetPath => write!(f, "GetPath"),
            Request::GetSystem => write!(f, "GetSystem"),
            Request::SetSystem(s) => write!(
                f,
                "SetSystem,{},{},{},{},{},{},{}",
                s.unit_code,
                s.stop_surf,
                s.ray_aiming,
                s.use_env_data,
                s.temperature,
                s.pressure,
                s.global_ref_surf
            ),
            Request::GetFirst => write!(f, "GetFirst"),
            Request::GetTrace {
                wave,
                mode,
                surf,
                hx,
                hy,
                px,
                py,
            } => write!(
                f,
                "GetTrace,{},{},{},{},{},{},{}",
                wave,
                mode.code(),
                surf,
                hx,
                hy,
                px,
                py
            ),
        }
    }
}
impl<'a> Request<'a> {
    /// Parses an item string back into a [`Request`]
    pub fn parse(item: &'a str) -> Result<Self, ProtocolError> {
        let mut parts = item.splitn(2, ',');
        let verb = parts.next().unwrap_or_default().trim();
        let args = parts.next().unwrap_or_default();
        match verb {
            "GetVersion" => Ok(Request::GetVersion),
            "LoadFile" => Ok(Request::LoadFile(args)),
            "GetUpdate" => Ok(Request::GetUpdate),
            "PushLens" => Ok(Request::PushLens {
                update: int_field(item, args)? != 0,
            }),
            "PushLensPermission" => Ok(Request::PushLensPermission),
            "NewLens" => Ok(Request::NewLens),
            "GetPath" => Ok(Request::GetPath),
            "GetSystem" => Ok(Request::GetSystem),
            "SetSystem" => {
                let f = count_fields("SetSystem", args, 7)?;
                Ok(Request::SetSystem(SystemSettings {
                    unit_code: int_field(item, f[0])?,
                    stop_surf: int_field(item, f[1])?,
                    ray_aiming: int_field(item, f[2])?,
                    use_env_data: int_field(item, f[3])?,
                    temperature: float_field(item, f[4])?,
                    pressure: float_field(item, f[5])?,
                    global_ref_surf: int_field(item, f[6])?,
                }))
            }
            "GetFirst" => Ok(Request::GetFirst),
            "GetTrace" => {
                let f = count_fields("GetTrace", args, 7)?;
                Ok(Request::GetTrace {
                    wave: int_field(item, f[0])?,
                    mode: TraceMode::from_code(int_field(item, f[1])?)?,
                    surf: int_field(item, f[2])?,
                    hx: float_field(item, f[3])?,
                    hy: float_field(item, f[4])?,
                    px: float_field(item, f[5])?,
                    py: float_field(item, f[6])?,
                })
            }
            _ => Err(ProtocolError::UnknownItem(item.into())),
        }
    }
}

/// `GetTrace` reply: a single ray traced to a surface
///
/// `(x, y, z)` is the ray intercept on the surface and `(l, m, n)` the
/// direction cosines after the surface, both in the surface local frame.
/// `(l2, m2, n2)` are the direction cosines of the surface normal at the
/// intercept. A non zero `error` means the ray could not be traced: positive
/// is total internal reflection at that surface, negative is a miss of the
/// surface `-error`. `vigcode` is the first surface that clips the ray, 0
/// when the ray gets through.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Trace {
    pub error: i32,
    pub vigcode: i32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub l: f64,
    pub m: f64,
    pub n: f64,
    pub l2: f64,
    pub m2: f64,
    pub n2: f64,
    pub intensity: f64,
}
impl Trace {
    pub fn is_traced(&self) -> bool {
        self.error == 0
    }
    pub fn is_vignetted(&self) -> bool {
        self.vigcode != 0
    }
}
impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.error,
            self.vigcode,
            self.x,
            self.y,
            self.z,
            self.l,
            self.m,
            self.n,
            self.l2,
            self.m2,
            self.n2,
            self.intensity
        )
    }
}

/// `GetSystem` reply: general lens system data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    pub num_surfs: i32,
    pub unit_code: i32,
    pub stop_surf: i32,
    pub non_axial: i32,
    pub ray_aiming: i32,
    pub adjust_index: i32,
    pub temperature: f64,
    pub pressure: f64,
    pub global_ref_surf: i32,
}
impl fmt::Display for SystemData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{}",
            self.num_surfs,
            self.unit_code,
            self.stop_surf,
            self.non_axial,
            self.ray_aiming,
            self.adjust_index,
            self.temperature,
            self.pressure,
            self.global_ref_surf
        )
    }
}

/// `SetSystem` arguments
///
/// Defaults to millimeter units, stop on surface 1, no ray aiming and
/// standard air at 20 degrees Celsius
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub unit_code: i32,
    pub stop_surf: i32,
    pub ray_aiming: i32,
    pub use_env_data: i32,
    pub temperature: f64,
    pub pressure: f64,
    pub global_ref_surf: i32,
}
impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            unit_code: 0,
            stop_surf: 1,
            ray_aiming: 0,
            use_env_data: 0,
            temperature: 20.0,
            pressure: 1.0,
            global_ref_surf: 1,
        }
    }
}
impl From<SystemData> for SystemSettings {
    /// Carries the system data over to a settings update
    fn from(sys: SystemData) -> Self {
        Self {
            unit_code: sys.unit_code,
            stop_surf: sys.stop_surf,
            ray_aiming: sys.ray_aiming,
            use_env_data: 0,
            temperature: sys.temperature,
            pressure: sys.pressure,
            global_ref_surf: sys.global_ref_surf,
        }
    }
}

/// `GetFirst` reply: first order properties of the lens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FirstOrder {
    /// Effective focal length in lens units
    pub efl: f64,
    pub paraxial_working_fnumber: f64,
    pub real_working_fnumber: f64,
    pub paraxial_image_height: f64,
    pub paraxial_magnification: f64,
}
impl fmt::Display for FirstOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.efl,
            self.paraxial_working_fnumber,
            self.real_working_fnumber,
            self.paraxial_image_height,
            self.paraxial_magnification
        )
    }
}

/// `GetPath` reply: the server data folder and the lens folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerPaths {
    pub data_dir: String,
    pub lens_dir: String,
}
impl fmt::Display for ServerPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.data_dir, self.lens_dir)
    }
}

/// Parses a reply holding a single status or version integer
pub fn parse_int(reply: &str) -> Result<i32, ProtocolError> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(ProtocolError::EmptyReply);
    }
    int_field(reply, reply)
}

/// Parses a `GetTrace` reply
pub fn parse_trace(reply: &str) -> Result<Trace, ProtocolError> {
    let f = count_fields("GetTrace", reply, 12)?;
    Ok(Trace {
        error: int_field(reply, f[0])?,
        vigcode: int_field(reply, f[1])?,
        x: float_field(reply, f[2])?,
        y: float_field(reply, f[3])?,
        z: float_field(reply, f[4])?,
        l: float_field(reply, f[5])?,
        m: float_field(reply, f[6])?,
        n: float_field(reply, f[7])?,
        l2: float_field(reply, f[8])?,
        m2: float_field(reply, f[9])?,
        n2: float_field(reply, f[10])?,
        intensity: float_field(reply, f[11])?,
    })
}

/// Parses a `GetSystem` or `SetSystem` reply
pub fn parse_system(reply: &str) -> Result<SystemData, ProtocolError> {
    let f = count_fields("GetSystem", reply, 9)?;
    Ok(SystemData {
        num_surfs: int_field(reply, f[0])?,
        unit_code: int_field(reply, f[1])?,
        stop_surf: int_field(reply, f[2])?,
        non_axial: int_field(reply, f[3])?,
        ray_aiming: int_field(reply, f[4])?,
        adjust_index: int_field(reply, f[5])?,
        temperature: float_field(reply, f[6])?,
        pressure: float_field(reply, f[7])?,
        global_ref_surf: int_field(reply, f[8])?,
    })
}

/// Parses a `GetFirst` reply
pub fn parse_first(reply: &str) -> Result<FirstOrder, ProtocolError> {
    let f = count_fields("GetFirst", reply, 5)?;
    Ok(FirstOrder {
        efl: float_field(reply, f[0])?,
        paraxial_working_fnumber: float_field(reply, f[1])?,
        real_working_fnumber: float_field(reply, f[2])?,
        paraxial_image_height: float_field(reply, f[3])?,
        paraxial_magnification: float_field(reply, f[4])?,
    })
}

/// Parses a `GetPath` reply
pub fn parse_path(reply: &str) -> Result<ServerPaths, ProtocolError> {
    let f = count_fields("GetPath", reply, 2)?;
    Ok(ServerPaths {
        data_dir: f[0].to_string(),
        lens_dir: f[1].to_string(),
    })
}

fn count_fields<'a>(
    what: &'static str,
    reply: &'a str,
    expected: usize,
) -> Result<Vec<&'a str>, ProtocolError> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(ProtocolError::EmptyReply);
    }
    let fields: Vec<_> = reply.split(',').map(str::trim).collect();
    if fields.len() != expected {
        return Err(ProtocolError::FieldCount {
            what,
            reply: reply.into(),
            expected,
            found: fields.len(),
        });
    }
    Ok(fields)
}

fn int_field(reply: &str, field: &str) -> Result<i32, ProtocolError> {
    field
        .trim()
        .parse()
        .map_err(|e| ProtocolError::Int(reply.into(), e))
}

fn float_field(reply: &str, field: &str) -> Result<f64, ProtocolError> {
    field
        .trim()
        .parse()
        .map_err(|e| ProtocolError::Float(reply.into(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_trace_item() {
        let item = Request::GetTrace {
            wave: 1,
            mode: TraceMode::Real,
            surf: IMAGE_SURFACE,
            hx: 0.0,
            hy: 0.0,
            px: -0.375,
            py: 0.5,
        }
        .to_string();
        assert_eq!(item, "GetTrace,1,0,-1,0,0,-0.375,0.5");
    }

    #[test]
    fn item_round_trip() {
        let items = [
            Request::GetVersion,
            Request::LoadFile("C:\\ZEMAX\\Samples\\Cooke 40 degree field.zmx"),
            Request::GetUpdate,
            Request::PushLens { update: true },
            Request::PushLensPermission,
            Request::NewLens,
            Request::GetPath,
            Request::GetSystem,
            Request::SetSystem(SystemSettings::default()),
            Request::GetFirst,
            Request::GetTrace {
                wave: 2,
                mode: TraceMode::Paraxial,
                surf: 4,
                hx: 0.0,
                hy: 1.0,
                px: 0.125,
                py: -0.125,
            },
        ];
        for item in items {
            let wire = item.to_string();
            assert_eq!(Request::parse(&wire).unwrap(), item, "{}", wire);
        }
    }

    #[test]
    fn unknown_item() {
        assert!(matches!(
            Request::parse("GetWave,1"),
            Err(ProtocolError::UnknownItem(_))
        ));
    }

    #[test]
    fn trace_reply_round_trip() {
        let trace = Trace {
            error: 0,
            vigcode: 0,
            x: 0.04811362451,
            y: -0.04811362451,
            z: 1.372462334e-3,
            l: 0.09950371902,
            m: -0.09950371902,
            n: 0.9900493732,
            l2: -0.001,
            m2: 0.001,
            n2: 0.999999,
            intensity: 1.0,
        };
        let parsed = parse_trace(&trace.to_string()).unwrap();
        assert_eq!(parsed, trace);
    }

    #[test]
    fn trace_reply_field_count() {
        assert!(matches!(
            parse_trace("0,0,1.0"),
            Err(ProtocolError::FieldCount {
                expected: 12,
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn status_reply() {
        assert_eq!(parse_int(" 0 ").unwrap(), OK);
        assert_eq!(parse_int("-999").unwrap(), REFUSED);
        assert!(parse_int("").is_err());
        assert!(parse_int("nan").is_err());
    }

    #[test]
    fn system_reply_round_trip() {
        let sys = SystemData {
            num_surfs: 7,
            unit_code: 0,
            stop_surf: 4,
            non_axial: 0,
            ray_aiming: 0,
            adjust_index: 0,
            temperature: 20.0,
            pressure: 1.0,
            global_ref_surf: 1,
        };
        assert_eq!(parse_system(&sys.to_string()).unwrap(), sys);
        let settings: SystemSettings = sys.into();
        assert_eq!(settings.unit_code, 0);
        assert_eq!(settings.stop_surf, 4);
    }

    #[test]
    fn path_reply() {
        let paths = parse_path("C:\\ZEMAX,C:\\ZEMAX\\Samples").unwrap();
        assert_eq!(paths.data_dir, "C:\\ZEMAX");
        assert_eq!(paths.lens_dir, "C:\\ZEMAX\\Samples");
    }
}
