//! Surveys the lens files of the server samples folder: every candidate is
//! loaded, normalized to millimeter units and ranked by effective focal
//! length. Files the server cannot open are skipped and listed at the end
//! of the report.
//!
//! An optional command line argument names the report file, default
//! `lens_survey.txt`.

use std::{fs::File, io::Write, path::Path};

use zdde::{Builder, LensDesign, Link, LinkError, Loopback, SystemSettings};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let report_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "lens_survey.txt".into());

    let mut link = Link::connect(Loopback::builder().build()?)?;
    let paths = link.get_path()?;

    // the builtin samples plus a file the server does not know
    let mut candidates: Vec<String> = LensDesign::catalog()
        .into_iter()
        .map(|design| design.file_name)
        .collect();
    candidates.push("Unobtainium relay.zmx".into());

    let mut surveyed = Vec::new();
    let mut not_loaded = Vec::new();
    for name in candidates {
        let file = Path::new(&paths.lens_dir).join(&name);
        match link.load_file(&file) {
            Ok(()) => {}
            Err(LinkError::Refused { .. }) => {
                log::warn!("the server cannot open {}", name);
                not_loaded.push(name);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        // survey in millimeters with a common global reference, the lens is
        // left as loaded otherwise
        let sys = link.get_system()?;
        let settings = SystemSettings {
            unit_code: 0,
            global_ref_surf: 1,
            ..sys.into()
        };
        link.set_system(settings)?;
        surveyed.push((name, link.get_first()?));
    }
    surveyed.sort_by(|a, b| b.1.efl.total_cmp(&a.1.efl));

    let mut file = File::create(&report_path)?;
    writeln!(file, "Lens survey of {}", paths.lens_dir)?;
    writeln!(
        file,
        "{} lenses surveyed, {} skipped",
        surveyed.len(),
        not_loaded.len()
    )?;
    writeln!(file)?;
    writeln!(file, "{:>10}  {:>8}  file", "EFL [mm]", "f/#")?;
    for (name, first) in &surveyed {
        writeln!(
            file,
            "{:>10.3}  {:>8.2}  {}",
            first.efl, first.paraxial_working_fnumber, name
        )?;
    }
    if !not_loaded.is_empty() {
        writeln!(file)?;
        writeln!(file, "Not loaded:")?;
        for name in &not_loaded {
            writeln!(file, "  {}", name)?;
        }
    }
    println!("survey written to {}", report_path);

    link.close();
    Ok(())
}
