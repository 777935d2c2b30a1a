use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use renderer::{
    GraphicsContext, HeadlessContext, Pipeline, PipelineDescriptor, TextureLoader, Viewer,
    ViewerConfig, QUAD_VERTEX_GLSL,
};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::FileConfig;

pub fn run(cli: Cli) -> Result<()> {
    let file = match cli.config.as_deref() {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FileConfig::default(),
    };
    let config = build_viewer_config(&cli, &file)?;
    tracing::debug!(
        title = %config.title,
        width = config.surface_size.0,
        height = config.surface_size.1,
        vsync = config.vsync,
        gpu_power = ?config.gpu_power,
        source = ?config.source,
        "resolved viewer configuration"
    );

    if cli.check {
        let report = check(&config)?;
        println!("{report}");
        return Ok(());
    }

    tracing::info!(title = %config.title, "starting shadercanvas viewer");
    Viewer::new(config).run()
}

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Layers built-in defaults, then the config file, then command-line flags.
pub fn build_viewer_config(cli: &Cli, file: &FileConfig) -> Result<ViewerConfig> {
    let mut config = ViewerConfig::default();

    let vertex_path = cli.vertex.as_deref().or(file.shader.vertex.as_deref());
    let fragment_path = cli.fragment.as_deref().or(file.shader.fragment.as_deref());
    let vertex_source = match vertex_path {
        Some(path) => read_shader(path, "vertex")?,
        None => QUAD_VERTEX_GLSL.to_string(),
    };
    let mut pipeline = match fragment_path {
        Some(path) => PipelineDescriptor::new(vertex_source, read_shader(path, "fragment")?),
        None => PipelineDescriptor {
            vertex_source,
            ..PipelineDescriptor::default()
        },
    };
    pipeline.uniforms = file.uniforms.to_names();
    config.pipeline = pipeline;

    if let Some(size) = cli.size {
        config.surface_size = (size.width, size.height);
    } else if let Some(size) = file.surface_size() {
        config.surface_size = size;
    }
    if let Some(title) = cli.title.clone().or_else(|| file.window.title.clone()) {
        config.title = title;
    }
    if cli.no_vsync {
        config.vsync = false;
    } else if let Some(vsync) = file.window.vsync {
        config.vsync = vsync;
    }
    if let Some(power) = cli.gpu_power {
        config.gpu_power = power;
    } else if let Some(power) = file.window.gpu_power {
        config.gpu_power = power.into();
    }

    config.source = cli
        .image
        .clone()
        .or_else(|| file.image.source.clone())
        .filter(|source| !source.trim().is_empty());

    Ok(config)
}

fn read_shader(path: &Path, stage: &str) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read {stage} shader {}", path.display()))
}

/// Builds the pipeline against a headless context, draws one frame and, when
/// a source is configured, fetches and decodes it synchronously.
pub fn check(config: &ViewerConfig) -> Result<String> {
    let mut ctx = HeadlessContext::new();
    let mut pipeline =
        Pipeline::new(&mut ctx, &config.pipeline).context("shader check failed")?;
    pipeline.render(&mut ctx);
    if ctx.draws().is_empty() {
        pipeline.dispose(&mut ctx);
        return Err(anyhow!("shader check failed: no frame was drawn"));
    }

    let mut report = String::from("shaders OK");
    if let Some(source) = config.source.as_deref() {
        let mut future = TextureLoader::default().load(&mut ctx, source);
        let outcome = future.wait(&mut ctx);
        let result = match outcome {
            Some(Ok(loaded)) => {
                report.push_str(&format!(
                    "; image {}x{} from {source}",
                    loaded.width, loaded.height
                ));
                ctx.delete_texture(loaded.texture);
                Ok(())
            }
            Some(Err(failed)) => {
                ctx.delete_texture(failed.texture);
                Err(anyhow::Error::new(failed.error).context("image check failed"))
            }
            None => Err(anyhow!("image check failed: load produced no outcome")),
        };
        if let Err(err) = result {
            pipeline.dispose(&mut ctx);
            return Err(err);
        }
    }

    pipeline.dispose(&mut ctx);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use renderer::{GpuPowerPreference, DEFAULT_FRAGMENT_GLSL};

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["shadercanvas"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let config = build_viewer_config(&cli(&[]), &FileConfig::default()).unwrap();
        assert_eq!(config.surface_size, (640, 480));
        assert_eq!(config.pipeline.fragment_source, DEFAULT_FRAGMENT_GLSL);
        assert_eq!(config.pipeline.vertex_source, QUAD_VERTEX_GLSL);
        assert!(config.vsync);
        assert_eq!(config.source, None);
    }

    #[test]
    fn flags_override_the_file() {
        let file = FileConfig::from_toml_str(
            "[window]\ntitle = \"from file\"\nwidth = 100\nheight = 50\nvsync = true\n\
             gpu_power = \"high\"\n[image]\nsource = \"file.png\"\n",
        )
        .unwrap();
        let args = cli(&[
            "cli.png",
            "--size",
            "300x200",
            "--no-vsync",
            "--gpu-power",
            "low",
        ]);
        let config = build_viewer_config(&args, &file).unwrap();
        assert_eq!(config.title, "from file");
        assert_eq!(config.surface_size, (300, 200));
        assert!(!config.vsync);
        assert_eq!(config.gpu_power, GpuPowerPreference::Low);
        assert_eq!(config.source.as_deref(), Some("cli.png"));
    }

    #[test]
    fn missing_shader_file_is_reported() {
        let err = build_viewer_config(
            &cli(&["--fragment", "/nonexistent/effect.frag"]),
            &FileConfig::default(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to read fragment shader"));
    }

    #[test]
    fn check_accepts_the_built_in_effect() {
        let report = check(&ViewerConfig::default()).unwrap();
        assert_eq!(report, "shaders OK");
    }

    #[test]
    fn check_rejects_a_broken_fragment_shader() {
        let mut config = ViewerConfig::default();
        config.pipeline = PipelineDescriptor::with_fragment("#version 450\nvoid main( {");
        let err = check(&config).unwrap_err();
        assert!(format!("{err:#}").contains("fragment shader failed to compile"));
    }

    #[test]
    fn check_decodes_the_configured_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        image::RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let config = ViewerConfig {
            source: Some(path.to_string_lossy().into_owned()),
            ..ViewerConfig::default()
        };
        let report = check(&config).unwrap();
        assert!(report.contains("image 4x3"));
    }

    #[test]
    fn check_reports_unreadable_images() {
        let config = ViewerConfig {
            source: Some("/nonexistent/photo.png".to_string()),
            ..ViewerConfig::default()
        };
        let err = check(&config).unwrap_err();
        assert!(format!("{err:#}").contains("image check failed"));
    }
}
