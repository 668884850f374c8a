//! `compose` and `dockerfile` commands.

use anyhow::{Context, Result};
use std::path::Path;
use switchyard_node::deploy::{compose_mesh, dockerfile_extensions, DockerfilePlace};
use switchyard_node::load_mesh;

pub fn cmd_compose(mesh: &Path, image: Option<&str>) -> Result<()> {
    let mesh = load_mesh(mesh).context("failed to load mesh file")?;
    let yaml = compose_mesh(&mesh.settings(), image)?;
    print!("{yaml}");
    Ok(())
}

pub fn cmd_dockerfile(mesh: &Path, place: &str) -> Result<()> {
    let place: DockerfilePlace = place.parse()?;
    let mesh = load_mesh(mesh).context("failed to load mesh file")?;
    let settings = mesh.settings();
    let lines = dockerfile_extensions(place, settings.values());
    if !lines.is_empty() {
        println!("{lines}");
    }
    Ok(())
}
