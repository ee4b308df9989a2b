fn main() -> Result<(), Box<dyn std::error::Error>> {
    algoserve::Server::new().package(demo_app::package).launch()?;
    Ok(())
}
