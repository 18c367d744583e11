use clap::Parser;
use kubetrader::app::Application;
use kubetrader::app::Tasks;
use kubetrader::config::DaemonArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::logging::init();

    let args = DaemonArgs::parse();
    let app = Application::build(args).await?;

    // SCC resources are bootstrapped in parallel with the service; the
    // agent is useful without them on non-openshift clusters.
    let scc_manager = app.services().scc_manager.clone();
    tokio::spawn(async move { scc_manager.bootstrap().await });

    let mut tasks = Tasks::new();
    let scc_manager = app.services().scc_manager.clone();
    tasks.register_cleanup(move || async move { scc_manager.teardown().await });

    tasks.spawn_all_tasks(&app)?;

    tracing::info!("********** Start running kubetrader service **********");
    tasks.wait_for_completion().await?;
    tracing::info!("Cleanup completed. Exiting gracefully.");
    Ok(())
}
