use idcache::simulation::sim_app::SimApp;

fn main() -> anyhow::Result<()> {
    SimApp::run().inspect_err(|err| {
        eprintln!("Simulation failed: {err:#}");
    })
}
