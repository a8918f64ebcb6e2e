#![cfg(feature = "simulation")]

use idcache::simulation::sim_app::SimApp;

#[test]
fn full_simulation() -> Result<(), Box<dyn std::error::Error>> {
    // Relaxed parameters so the simulation runs quickly.
    let report = SimApp::new()
        .cli_args(vec![
            "full_simulation_test",
            "--quiet",
            "--nodes=3",
            "--clients=2",
            "--operations=150",
            "--names=20",
            "--max-workers=4",
            "--contention-threshold=2",
            "--latency-us=100",
            "--seed=20240611",
        ])
        .execute()?
        .ok_or("no report")?;

    assert_eq!(report.nodes, 3);
    assert_eq!(report.stats.total(), 3 * 2 * 150);
    assert!(report.stats.applied > 0, "nothing was applied: {report:?}");
    assert!(report.peak_workers >= 1);

    Ok(())
}

#[test]
fn simulation_survives_an_outage() -> Result<(), Box<dyn std::error::Error>> {
    let report = SimApp::new()
        .cli_args(vec![
            "outage_simulation_test",
            "--quiet",
            "--nodes=2",
            "--clients=2",
            "--operations=300",
            "--names=15",
            "--latency-us=200",
            "--outage-ms=60",
            "--seed=7",
        ])
        .execute()?
        .ok_or("no report")?;

    assert_eq!(report.stats.total(), 2 * 2 * 300);

    Ok(())
}

#[test]
fn tiny_change_log_still_converges() -> Result<(), Box<dyn std::error::Error>> {
    let report = SimApp::new()
        .cli_args(vec![
            "tiny_log_simulation_test",
            "--quiet",
            "--nodes=3",
            "--clients=2",
            "--operations=200",
            "--names=30",
            "--log-capacity=4",
            "--latency-us=50",
            "--seed=11",
        ])
        .execute()?
        .ok_or("no report")?;

    assert_eq!(report.stats.total(), 3 * 2 * 200);
    assert!(report.stats.applied > 0, "nothing was applied: {report:?}");

    Ok(())
}
