use std::time::Instant;

use zdde::{
    Builder, Link, LinkError, Loopback, ParityCheck, PupilGrid, SpeedTestBuilder, TracePath,
};

#[test]
fn parity_and_speed_session() -> anyhow::Result<()> {
    let mut link = Link::connect(Loopback::builder().build()?)?;

    let paths = link.get_path()?;
    assert!(link.push_lens_permission()?);
    link.load_file(format!("{}\\Cooke 40 degree field.zmx", paths.lens_dir))?;
    link.get_update()?;
    link.push_lens(true)?;

    let now = Instant::now();
    let parity = ParityCheck::new(PupilGrid::with_ray_target(81)).run(&mut link)?;
    println!("Parity of 81 rays in {:?}", now.elapsed());
    println!("{parity}");
    assert_eq!(parity.rays, 81);
    assert_eq!(parity.max_deviation(), 0.0);

    let speed = SpeedTestBuilder::default()
        .ray_counts(vec![9, 169, 529])
        .runs(5)
        .keep(3)
        .build()?;
    let now = Instant::now();
    let report = speed.run(&mut link)?;
    println!("Speed schedule in {:?}", now.elapsed());
    println!("{report}");
    assert_eq!(report.rows.len(), 9);
    for path in TracePath::ALL {
        for rays in [9, 169, 529] {
            assert!(
                report.millis(path, rays).is_some(),
                "missing {path} at {rays} rays"
            );
        }
    }

    link.new_lens()?;
    link.push_lens(true)?;
    link.close();
    Ok(())
}

#[test]
fn survey_session() -> anyhow::Result<()> {
    let mut link = Link::connect(Loopback::builder().build()?)?;

    let mut surveyed = Vec::new();
    let mut skipped = Vec::new();
    for name in [
        "Double Gauss 28 degree field.zmx",
        "No such lens.zmx",
        "Petzval portrait 12 degree field.zmx",
    ] {
        match link.load_file(name) {
            Ok(()) => {
                let sys = link.get_system()?;
                link.set_system(sys.into())?;
                surveyed.push((name, link.get_first()?.efl));
            }
            Err(LinkError::Refused { .. }) => skipped.push(name),
            Err(e) => return Err(e.into()),
        }
    }
    surveyed.sort_by(|a, b| b.1.total_cmp(&a.1));

    assert_eq!(skipped, vec!["No such lens.zmx"]);
    assert_eq!(surveyed.len(), 2);
    assert_eq!(surveyed.first().map(|&(_, efl)| efl), Some(120.0));

    link.close();
    Ok(())
}
