use std::{path::Path, time::Duration};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tessera::{DebugFlags, DeviceDesc, DeviceType, PresentMode};

pub const CONFIG_PATH: &str = "config.toml";

#[derive(Clone, Debug, Default, Parser)]
#[command(version, about, long_about = None)]
pub struct CliRenderSettings {
    #[arg(short, long)]
    pub width: Option<u32>,

    #[arg(short = 'H', long)]
    pub height: Option<u32>,

    #[arg(short, long, value_enum)]
    pub backend: Option<DeviceType>,

    /// Enables API validation layers.
    #[arg(short, long)]
    pub debug: bool,

    #[arg(long, value_enum)]
    pub present_mode: Option<PresentMode>,

    /// Fails a CPU wait on the GPU after this many milliseconds.
    #[arg(long)]
    pub sync_timeout_ms: Option<u64>,

    #[arg(long, value_delimiter = ',')]
    pub clear_color: Option<Vec<f32>>,

    /// Exits after presenting this many frames.
    #[arg(long)]
    pub frame_limit: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TomlRenderSettings {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_backend")]
    pub backend: DeviceType,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub present_mode: PresentMode,

    pub sync_timeout_ms: Option<u64>,

    pub clear_color: Option<[f32; 4]>,

    pub frame_limit: Option<u64>,
}

impl Default for TomlRenderSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            backend: default_backend(),
            debug: false,
            present_mode: PresentMode::default(),
            sync_timeout_ms: None,
            clear_color: None,
            frame_limit: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub backend: DeviceType,
    pub debug: bool,
    pub present_mode: PresentMode,
    pub sync_timeout: Option<Duration>,
    pub clear_color: Option<[f32; 4]>,
    pub frame_limit: Option<u64>,
}

impl RenderSettings {
    pub fn device_desc(&self) -> DeviceDesc {
        DeviceDesc {
            debug: if self.debug {
                DebugFlags::all()
            } else {
                DebugFlags::empty()
            },
            present_mode: self.present_mode,
            sync_timeout: self.sync_timeout,
            clear_color: self.clear_color,
        }
    }
}

pub fn read_settings() -> anyhow::Result<RenderSettings> {
    load_settings(CliRenderSettings::parse(), Path::new(CONFIG_PATH))
}

/// Reads `path` if it exists and lays the CLI flags over it.
pub fn load_settings(cli: CliRenderSettings, path: &Path) -> anyhow::Result<RenderSettings> {
    let toml = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => TomlRenderSettings::default(),
        Err(err) => return Err(err.into()),
    };

    merge_settings(cli, toml)
}

pub fn merge_settings(
    cli: CliRenderSettings,
    toml: TomlRenderSettings,
) -> anyhow::Result<RenderSettings> {
    let clear_color = match cli.clear_color {
        Some(color) => Some(
            <[f32; 4]>::try_from(color.as_slice())
                .map_err(|_| anyhow::anyhow!("clear color needs exactly 4 components"))?,
        ),
        None => toml.clear_color,
    };

    Ok(RenderSettings {
        width: cli.width.unwrap_or(toml.width),
        height: cli.height.unwrap_or(toml.height),
        backend: cli.backend.unwrap_or(toml.backend),
        debug: cli.debug || toml.debug,
        present_mode: cli.present_mode.unwrap_or(toml.present_mode),
        sync_timeout: cli
            .sync_timeout_ms
            .or(toml.sync_timeout_ms)
            .map(Duration::from_millis),
        clear_color,
        frame_limit: cli.frame_limit.or(toml.frame_limit),
    })
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_backend() -> DeviceType {
    if cfg!(windows) {
        DeviceType::Dx12
    } else {
        DeviceType::Vulkan
    }
}
