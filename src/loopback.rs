//!
//! # Loopback server
//!
//! An in-process stand-in for the DDE server. It answers the whole item
//! vocabulary of [`protocol`](crate::protocol) and the bulk ray exchange from
//! a small catalog of ideal lens models, deterministically, so sessions,
//! parity checks and timing runs work anywhere the crate compiles.
//!
//! The server keeps the two lens copies the real application keeps: its own
//! copy, addressed by the text items, and the pushed copy the array trace
//! runs against. Pushing must therefore happen before the first array trace,
//! exactly as with the real server.
//!
//! Both the text trace and the array trace answer from the same closed form
//! model, and replies are formatted with shortest round trip notation, so the
//! three tracing paths agree to the last bit on a loopback session.
//!
//! An optional per request latency and a per ray cost emulate the IPC price
//! of a real conversation for timing demonstrations; both default to off.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::{thread, time::Duration};

use crate::{
    protocol::{FirstOrder, Request, ServerPaths, SystemData, Trace, INVALID, OK, REFUSED},
    Builder, RayRecord, Transport, TransportError,
};

#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("two catalog designs share the file name `{0}`")]
    DuplicateDesign(String),
    #[error("design `{0}` is not traceable: focal length, aperture and wavelength count must be positive")]
    Untraceable(String),
}

/// An ideal lens model the loopback server can serve
///
/// The model images a collimated beam of half field angle
/// `half_field_deg * hx` onto an image sphere of radius `field_curvature`
/// (0 for a flat image plane) shifted by `defocus` plus a per wavelength
/// `chromatic_shift`. Lengths are millimeters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensDesign {
    pub file_name: String,
    pub efl: f64,
    pub semi_aperture: f64,
    pub half_field_deg: f64,
    pub field_curvature: f64,
    pub defocus: f64,
    pub chromatic_shift: f64,
    pub n_waves: i32,
    pub num_surfs: i32,
    pub stop_surf: i32,
}
impl LensDesign {
    /// The Cooke triplet sample lens
    pub fn cooke_40() -> Self {
        Self {
            file_name: "Cooke 40 degree field.zmx".into(),
            efl: 50.0,
            semi_aperture: 5.0,
            half_field_deg: 20.0,
            field_curvature: -180.0,
            defocus: 0.05,
            chromatic_shift: 0.02,
            n_waves: 3,
            num_surfs: 7,
            stop_surf: 4,
        }
    }
    /// The double Gauss sample lens
    pub fn double_gauss_28() -> Self {
        Self {
            file_name: "Double Gauss 28 degree field.zmx".into(),
            efl: 100.0,
            semi_aperture: 16.7,
            half_field_deg: 14.0,
            field_curvature: -220.0,
            defocus: 0.1,
            chromatic_shift: 0.03,
            n_waves: 3,
            num_surfs: 11,
            stop_surf: 6,
        }
    }
    /// The Tessar sample lens
    pub fn tessar_44() -> Self {
        Self {
            file_name: "Tessar 44 degree field.zmx".into(),
            efl: 52.0,
            semi_aperture: 6.5,
            half_field_deg: 22.0,
            field_curvature: -160.0,
            defocus: 0.08,
            chromatic_shift: 0.025,
            n_waves: 3,
            num_surfs: 8,
            stop_surf: 3,
        }
    }
    /// The Petzval portrait sample lens
    pub fn petzval_12() -> Self {
        Self {
            file_name: "Petzval portrait 12 degree field.zmx".into(),
            efl: 120.0,
            semi_aperture: 17.0,
            half_field_deg: 6.0,
            field_curvature: -90.0,
            defocus: 0.02,
            chromatic_shift: 0.04,
            n_waves: 2,
            num_surfs: 9,
            stop_surf: 5,
        }
    }
    /// The lens the server holds after `NewLens`: a single ideal surface
    /// focusing an on-axis beam onto a flat image plane
    pub fn new_lens() -> Self {
        Self {
            file_name: "Untitled".into(),
            efl: 100.0,
            semi_aperture: 10.0,
            half_field_deg: 0.0,
            field_curvature: 0.0,
            defocus: 0.0,
            chromatic_shift: 0.0,
            n_waves: 1,
            num_surfs: 2,
            stop_surf: 1,
        }
    }
    /// The builtin sample catalog
    pub fn catalog() -> Vec<Self> {
        vec![
            Self::cooke_40(),
            Self::double_gauss_28(),
            Self::tessar_44(),
            Self::petzval_12(),
        ]
    }
    fn first_order(&self) -> FirstOrder {
        let pwfn = self.efl / (2.0 * self.semi_aperture);
        FirstOrder {
            efl: self.efl,
            paraxial_working_fnumber: pwfn,
            real_working_fnumber: pwfn * 1.03,
            paraxial_image_height: self.efl * self.half_field_deg.to_radians().tan(),
            paraxial_magnification: 0.0,
        }
    }
    /// Traces one ray with normalized field `(hx, hy)` and pupil `(px, py)`
    /// coordinates through to the image surface
    fn trace(&self, hx: f64, hy: f64, px: f64, py: f64, wave: i32, intensity: f64) -> Trace {
        if wave < 1 || wave > self.n_waves {
            return Trace {
                error: INVALID,
                intensity,
                ..Default::default()
            };
        }
        let theta = self.half_field_deg.to_radians();
        let p = Vector3::new(self.semi_aperture * px, self.semi_aperture * py, 0.0);
        // an ideal lens folds the whole design into its cardinal planes: a
        // collimated field beam converges to the focal point of its angle
        let focus = Vector3::new(
            -self.efl * (hx * theta).tan(),
            -self.efl * (hy * theta).tan(),
            self.efl,
        );
        let d = (focus - p).normalize();
        let vertex = self.efl + self.defocus + self.chromatic_shift * f64::from(wave - 1);
        let (hit, normal) = if self.field_curvature == 0.0 {
            let t = (vertex - p.z) / d.z;
            // the intercept lies on the plane by definition, keep its z exact
            let hit = Vector3::new(p.x + d.x * t, p.y + d.y * t, vertex);
            (hit, Vector3::new(0.0, 0.0, 1.0))
        } else {
            let r = self.field_curvature;
            let center = Vector3::new(0.0, 0.0, vertex + r);
            let oc = p - center;
            let b = d.dot(&oc);
            let disc = b * b - (oc.norm_squared() - r * r);
            if disc < 0.0 {
                // the ray never meets the image sphere
                return Trace {
                    error: -self.num_surfs,
                    intensity,
                    ..Default::default()
                };
            }
            // of the two sphere crossings, keep the one on the vertex side
            let t_plane = (vertex - p.z) / d.z;
            let (t1, t2) = (-b - disc.sqrt(), -b + disc.sqrt());
            let t = if (t1 - t_plane).abs() <= (t2 - t_plane).abs() {
                t1
            } else {
                t2
            };
            let hit = p + d * t;
            (hit, (center - hit) / r)
        };
        let vigcode = if px * px + py * py > 1.0 {
            self.stop_surf
        } else {
            0
        };
        Trace {
            error: 0,
            vigcode,
            x: hit.x,
            y: hit.y,
            z: hit.z - vertex,
            l: d.x,
            m: d.y,
            n: d.z,
            l2: normal.x,
            m2: normal.y,
            n2: normal.z,
            intensity,
        }
    }
}

/// [`Loopback`] builder
///
/// Default properties:
///  * catalog         : the four builtin sample lenses
///  * push permission : granted
///  * request latency : none
///  * per ray cost    : none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackBuilder {
    catalog: Vec<LensDesign>,
    push_permission: bool,
    request_latency: Option<Duration>,
    per_ray_cost: Option<Duration>,
    version: i32,
    paths: ServerPaths,
}
impl Default for LoopbackBuilder {
    fn default() -> Self {
        Self {
            catalog: LensDesign::catalog(),
            push_permission: true,
            request_latency: None,
            per_ray_cost: None,
            version: 140200,
            paths: ServerPaths {
                data_dir: "C:\\ZEMAX".into(),
                lens_dir: "C:\\ZEMAX\\Samples".into(),
            },
        }
    }
}
impl LoopbackBuilder {
    /// Replaces the lens catalog
    pub fn catalog(self, catalog: Vec<LensDesign>) -> Self {
        Self { catalog, ..self }
    }
    /// Adds a lens to the catalog
    pub fn design(mut self, design: LensDesign) -> Self {
        self.catalog.push(design);
        self
    }
    /// Grants or denies the lens push permission
    pub fn push_permission(self, push_permission: bool) -> Self {
        Self {
            push_permission,
            ..self
        }
    }
    /// Emulates the round trip price of a text item request
    pub fn request_latency(self, latency: Duration) -> Self {
        Self {
            request_latency: Some(latency),
            ..self
        }
    }
    /// Emulates the tracing work per ray of the bulk exchange
    pub fn per_ray_cost(self, cost: Duration) -> Self {
        Self {
            per_ray_cost: Some(cost),
            ..self
        }
    }
    /// Sets the version the server reports
    pub fn version(self, version: i32) -> Self {
        Self { version, ..self }
    }
    /// Sets the folders `GetPath` reports
    pub fn paths(self, data_dir: &str, lens_dir: &str) -> Self {
        Self {
            paths: ServerPaths {
                data_dir: data_dir.into(),
                lens_dir: lens_dir.into(),
            },
            ..self
        }
    }
}
impl Builder for LoopbackBuilder {
    type Component = Loopback;

    fn build(self) -> crate::Result<Self::Component> {
        for (k, design) in self.catalog.iter().enumerate() {
            if design.efl <= 0.0 || design.semi_aperture <= 0.0 || design.n_waves < 1 {
                return Err(LoopbackError::Untraceable(design.file_name.clone()).into());
            }
            if self.catalog[..k]
                .iter()
                .any(|other| other.file_name.eq_ignore_ascii_case(&design.file_name))
            {
                return Err(LoopbackError::DuplicateDesign(design.file_name.clone()).into());
            }
        }
        Ok(Loopback {
            catalog: self.catalog,
            server_lens: LensDesign::new_lens(),
            pushed: None,
            push_permission: self.push_permission,
            request_latency: self.request_latency,
            per_ray_cost: self.per_ray_cost,
            version: self.version,
            paths: self.paths,
            env: Environment::default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Environment {
    unit_code: i32,
    ray_aiming: i32,
    temperature: f64,
    pressure: f64,
    global_ref_surf: i32,
}
impl Default for Environment {
    fn default() -> Self {
        Self {
            unit_code: 0,
            ray_aiming: 0,
            temperature: 20.0,
            pressure: 1.0,
            global_ref_surf: 1,
        }
    }
}

/// The in-process stand-in DDE server
pub struct Loopback {
    catalog: Vec<LensDesign>,
    server_lens: LensDesign,
    pushed: Option<LensDesign>,
    push_permission: bool,
    request_latency: Option<Duration>,
    per_ray_cost: Option<Duration>,
    version: i32,
    paths: ServerPaths,
    env: Environment,
}
impl Loopback {
    pub fn builder() -> LoopbackBuilder {
        Default::default()
    }
    fn system_data(&self) -> SystemData {
        SystemData {
            num_surfs: self.server_lens.num_surfs,
            unit_code: self.env.unit_code,
            stop_surf: self.server_lens.stop_surf,
            non_axial: 0,
            ray_aiming: self.env.ray_aiming,
            adjust_index: 0,
            temperature: self.env.temperature,
            pressure: self.env.pressure,
            global_ref_surf: self.env.global_ref_surf,
        }
    }
    fn load(&mut self, path: &str) -> i32 {
        let name = path.rsplit(['\\', '/']).next().unwrap_or(path).trim();
        match self
            .catalog
            .iter()
            .find(|d| d.file_name.eq_ignore_ascii_case(name))
        {
            Some(design) => {
                self.server_lens = design.clone();
                log::debug!("loopback loaded `{}`", self.server_lens.file_name);
                OK
            }
            None => REFUSED,
        }
    }
}
impl Transport for Loopback {
    fn request(&mut self, item: &str, _timeout: Duration) -> Result<String, TransportError> {
        if let Some(latency) = self.request_latency {
            thread::sleep(latency);
        }
        let Ok(req) = Request::parse(item) else {
            return Ok(INVALID.to_string());
        };
        Ok(match req {
            Request::GetVersion => self.version.to_string(),
            Request::LoadFile(path) => self.load(path).to_string(),
            Request::GetUpdate => OK.to_string(),
            Request::PushLens { update: _ } => {
                if self.push_permission {
                    self.pushed = Some(self.server_lens.clone());
                    OK.to_string()
                } else {
                    REFUSED.to_string()
                }
            }
            Request::PushLensPermission => i32::from(self.push_permission).to_string(),
            Request::NewLens => {
                self.server_lens = LensDesign::new_lens();
                OK.to_string()
            }
            Request::GetPath => self.paths.to_string(),
            Request::GetSystem => self.system_data().to_string(),
            Request::SetSystem(s) => {
                self.env = Environment {
                    unit_code: s.unit_code,
                    ray_aiming: s.ray_aiming,
                    temperature: s.temperature,
                    pressure: s.pressure,
                    global_ref_surf: s.global_ref_surf,
                };
                self.server_lens.stop_surf = s.stop_surf;
                self.system_data().to_string()
            }
            Request::GetFirst => self.server_lens.first_order().to_string(),
            Request::GetTrace {
                wave,
                mode: _,
                surf: _,
                hx,
                hy,
                px,
                py,
            } => self.server_lens.trace(hx, hy, px, py, wave, 1.0).to_string(),
        })
    }
    fn exchange_rays(
        &mut self,
        records: &mut [RayRecord],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if let Some(latency) = self.request_latency {
            thread::sleep(latency);
        }
        let Some(lens) = self.pushed.as_ref() else {
            return Err(TransportError::Server(REFUSED));
        };
        let Some((header, rays)) = records.split_first_mut() else {
            return Err(TransportError::Server(INVALID));
        };
        if header.error as usize != rays.len() || header.opd != 0.0 {
            return Err(TransportError::Server(INVALID));
        }
        if let Some(cost) = self.per_ray_cost {
            thread::sleep(cost * rays.len() as u32);
        }
        for r in rays {
            let t = lens.trace(r.x, r.y, r.z, r.l, r.wave, r.intensity);
            r.x = t.x;
            r.y = t.y;
            r.z = t.z;
            r.l = t.l;
            r.m = t.m;
            r.n = t.n;
            r.opd = 0.0;
            r.intensity = t.intensity;
            r.exr = t.l2;
            r.exi = 0.0;
            r.eyr = t.m2;
            r.eyi = 0.0;
            r.ezr = t.n2;
            r.ezi = 0.0;
            r.error = t.error;
            r.vigcode = t.vigcode;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, TraceMode, IMAGE_SURFACE};
    use crate::{PupilGrid, RayBatch};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn ready(design: LensDesign) -> Loopback {
        let mut server = Loopback::builder()
            .catalog(vec![design.clone()])
            .build()
            .unwrap();
        let load = Request::LoadFile(&design.file_name).to_string();
        assert_eq!(server.request(&load, TIMEOUT).unwrap(), "0");
        let push = Request::PushLens { update: true }.to_string();
        assert_eq!(server.request(&push, TIMEOUT).unwrap(), "0");
        server
    }

    fn text_trace(server: &mut Loopback, px: f64, py: f64, wave: i32) -> Trace {
        let item = Request::GetTrace {
            wave,
            mode: TraceMode::Real,
            surf: IMAGE_SURFACE,
            hx: 0.0,
            hy: 0.0,
            px,
            py,
        }
        .to_string();
        protocol::parse_trace(&server.request(&item, TIMEOUT).unwrap()).unwrap()
    }

    #[test]
    fn text_and_array_paths_agree_to_the_bit() {
        let mut server = ready(LensDesign::cooke_40());
        let grid = PupilGrid::new(2);
        let mut batch = RayBatch::from_grid(&grid, 1);
        server.exchange_rays(batch.records_mut(), TIMEOUT).unwrap();
        for (k, (px, py)) in grid.points().enumerate() {
            let text = text_trace(&mut server, px, py, 1);
            assert_eq!(text, batch.rays()[k].as_trace(), "ray {k} at ({px},{py})");
        }
    }

    #[test]
    fn replies_are_deterministic() {
        let mut server = ready(LensDesign::double_gauss_28());
        let item = "GetTrace,1,0,-1,0,0,0.3,-0.7";
        let first = server.request(item, TIMEOUT).unwrap();
        let second = server.request(item, TIMEOUT).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn overfilled_pupil_is_vignetted() {
        let mut server = ready(LensDesign::cooke_40());
        let trace = text_trace(&mut server, 0.8, 0.8, 1);
        assert_eq!(trace.error, 0);
        assert_eq!(trace.vigcode, LensDesign::cooke_40().stop_surf);
    }

    #[test]
    fn wave_out_of_range() {
        let mut server = ready(LensDesign::cooke_40());
        let trace = text_trace(&mut server, 0.0, 0.0, 9);
        assert_eq!(trace.error, INVALID);
    }

    #[test]
    fn flat_image_has_no_sag() {
        let mut server = Loopback::builder().build().unwrap();
        // the untouched server lens is the flat field new lens
        let trace = text_trace(&mut server, 0.5, -0.5, 1);
        assert_eq!(trace.z, 0.0);
        assert_eq!((trace.l2, trace.m2, trace.n2), (0.0, 0.0, 1.0));
    }

    #[test]
    fn curved_image_sags_off_axis() {
        let mut server = ready(LensDesign::cooke_40());
        let chief = text_trace(&mut server, 0.0, 0.0, 1);
        assert!(chief.z.abs() < 1e-12);
        let marginal = text_trace(&mut server, 1.0, 0.0, 1);
        assert!(marginal.z != 0.0);
        let norm = (marginal.l2.powi(2) + marginal.m2.powi(2) + marginal.n2.powi(2)).sqrt();
        assert!((norm - 1.0).abs() < 1e-12);
        assert!(marginal.n2 > 0.0);
    }

    #[test]
    fn ray_missing_the_image_sphere() {
        // a marginal ray sails past a pinhead image sphere parked well
        // beyond the focus
        let design = LensDesign {
            file_name: "Pinhead.zmx".into(),
            field_curvature: -0.5,
            defocus: 5.0,
            ..LensDesign::cooke_40()
        };
        let mut server = ready(design.clone());
        let trace = text_trace(&mut server, 1.0, 1.0, 1);
        assert_eq!(trace.error, -design.num_surfs);
    }

    #[test]
    fn array_trace_runs_on_the_pushed_copy() {
        let mut server = ready(LensDesign::cooke_40());
        // a NewLens only touches the server copy
        server.request("NewLens", TIMEOUT).unwrap();
        let grid = PupilGrid::new(1);
        let mut batch = RayBatch::from_grid(&grid, 3);
        server.exchange_rays(batch.records_mut(), TIMEOUT).unwrap();
        // wave 3 exists in the pushed Cooke, not in the new lens
        assert!(batch.rays().iter().all(|r| r.error == 0));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut server = ready(LensDesign::cooke_40());
        let mut batch = RayBatch::from_grid(&PupilGrid::new(1), 1);
        batch.records_mut()[0].error = 5;
        assert!(matches!(
            server.exchange_rays(batch.records_mut(), TIMEOUT),
            Err(TransportError::Server(INVALID))
        ));
    }

    #[test]
    fn unknown_item_reply() {
        let mut server = Loopback::builder().build().unwrap();
        assert_eq!(server.request("GetWave,0", TIMEOUT).unwrap(), "-1");
    }

    #[test]
    fn duplicate_catalog_entry() {
        let result = Loopback::builder().design(LensDesign::cooke_40()).build();
        assert!(result.is_err());
    }

    #[test]
    fn first_order_report() {
        let mut server = ready(LensDesign::cooke_40());
        let reply = server.request("GetFirst", TIMEOUT).unwrap();
        let first = protocol::parse_first(&reply).unwrap();
        assert_eq!(first.efl, 50.0);
        assert_eq!(first.paraxial_working_fnumber, 5.0);
    }
}
