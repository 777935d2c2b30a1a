use std::fs;
use std::process::Command;

fn shadercanvas() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_shadercanvas"));
    command.env_remove("SHADERCANVAS_CONFIG").env("RUST_LOG", "warn");
    command
}

const SAMPLING_FRAGMENT: &str = r#"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 fragColor;

layout(std140, set = 0, binding = 0) uniform Params {
    float uTime;
    vec2 sourceResolution;
};
layout(set = 1, binding = 0) uniform texture2D sourceTexture;
layout(set = 1, binding = 1) uniform sampler sourceSampler;

void main() {
    vec4 base = texture(sampler2D(sourceTexture, sourceSampler), v_uv);
    fragColor = vec4(base.rgb * (0.5 + 0.5 * sin(uTime)), min(sourceResolution.x, 1.0));
}
"#;

#[test]
fn check_passes_for_a_valid_fragment_shader() {
    let dir = tempfile::tempdir().unwrap();
    let fragment = dir.path().join("sampling.frag");
    fs::write(&fragment, SAMPLING_FRAGMENT).unwrap();

    let output = shadercanvas()
        .arg("--check")
        .arg("--fragment")
        .arg(&fragment)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("shaders OK"));
}

#[test]
fn check_fails_for_a_broken_fragment_shader() {
    let dir = tempfile::tempdir().unwrap();
    let fragment = dir.path().join("broken.frag");
    fs::write(&fragment, "#version 450\nvoid main() { this is not glsl }\n").unwrap();

    let output = shadercanvas()
        .arg("--check")
        .arg("--fragment")
        .arg(&fragment)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("fragment shader failed to compile"),
        "stderr: {stderr}"
    );
}

#[test]
fn check_reads_shaders_from_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("sampling.frag"), SAMPLING_FRAGMENT).unwrap();
    let config = dir.path().join("canvas.toml");
    fs::write(&config, "[shader]\nfragment = \"sampling.frag\"\n").unwrap();

    let output = shadercanvas()
        .arg("--check")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
