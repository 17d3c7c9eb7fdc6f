//! Checks that the three ray tracing paths agree on the sample Cooke
//! triplet, then times them over the growing ray count schedule.
//!
//! An optional command line argument names a [`SpeedTestBuilder`] toml file
//! overriding the default schedule. The loopback server stands in for the
//! real one, with a round trip latency dialed in so the timing gap between
//! the per ray path and the bulk paths shows.

use std::{path::Path, time::Duration};

use zdde::{
    Builder, Link, Loopback, ParityCheck, PupilGrid, SpeedTest, SpeedTestBuilder,
};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let speed = match std::env::args().nth(1) {
        Some(config) => SpeedTestBuilder::load(config)?,
        None => SpeedTest::builder(),
    }
    .build()?;

    let server = Loopback::builder()
        .request_latency(Duration::from_micros(150))
        .per_ray_cost(Duration::from_nanos(300))
        .build()?;
    let mut link = Link::connect(server)?;

    let paths = link.get_path()?;
    let file = Path::new(&paths.lens_dir)
        .join("Sequential")
        .join("Objectives")
        .join("Cooke 40 degree field.zmx");
    link.load_file(&file)?;
    link.get_update()?;
    link.push_lens(true)?;

    let parity = ParityCheck::new(PupilGrid::with_ray_target(81)).run(&mut link)?;
    print!("{parity}");

    let report = speed.run(&mut link)?;
    print!("{report}");

    link.new_lens()?;
    link.push_lens(true)?;
    link.close();
    Ok(())
}
