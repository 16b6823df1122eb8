use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use x86_cfgcpu::logging::{LogCategory, LogConfig, LogLevel};
use x86_cfgcpu::{
    CfgCpu, CfgStats, CpuConfig, CpuModel, Ram, RegisterSnapshot, SegmentedAddress,
};

/// Segment a .COM image gets; the PSP occupies its first 256 bytes
const COM_SEGMENT: u16 = 0x1000;
const COM_OFFSET: u16 = 0x0100;
const BOOT_ADDRESS: SegmentedAddress = SegmentedAddress::new(0x0000, 0x7C00);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ImageFormat {
    /// DOS .COM image, loaded at 1000:0100
    Com,
    /// Raw boot sector, loaded at 0000:7C00
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Model {
    I8086,
    I80186,
    I80286,
    I80386,
}

impl From<Model> for CpuModel {
    fn from(model: Model) -> Self {
        match model {
            Model::I8086 => CpuModel::Intel8086,
            Model::I80186 => CpuModel::Intel80186,
            Model::I80286 => CpuModel::Intel80286,
            Model::I80386 => CpuModel::Intel80386,
        }
    }
}

#[derive(Parser)]
#[command(about = "Run a flat x86 binary on the CFG CPU and dump its registers")]
struct Args {
    /// Program image to run
    image: PathBuf,

    /// How to load the image (guessed from the extension when omitted)
    #[arg(long, value_enum)]
    format: Option<ImageFormat>,

    /// JSON CPU configuration; command line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    model: Option<Model>,

    /// Enable the block JIT
    #[arg(long, default_value_t = false)]
    jit: bool,

    /// Stop on invalid opcodes instead of raising INT 6
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Instruction budget
    #[arg(long, default_value_t = 1_000_000)]
    max_instructions: u64,

    /// Global log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Per-category level, e.g. --log cfg=debug (repeatable)
    #[arg(long = "log", value_name = "CATEGORY=LEVEL")]
    log_categories: Vec<String>,

    /// Write log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Dump the final state to this file as JSON
    #[arg(long)]
    save: Option<PathBuf>,

    /// Suppress the JSON dump on stdout
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

#[derive(Serialize)]
struct RunReport {
    halted: bool,
    instructions: u64,
    registers: RegisterSnapshot,
    stats: CfgStats,
}

fn configure_logging(args: &Args) -> Result<()> {
    let logs = LogConfig::global();
    let level = LogLevel::from_str(&args.log_level)
        .with_context(|| format!("unknown log level '{}'", args.log_level))?;
    logs.set_global_level(level);
    for spec in &args.log_categories {
        let Some((category, level)) = spec.split_once('=') else {
            bail!("expected CATEGORY=LEVEL, got '{}'", spec);
        };
        let category = LogCategory::from_str(category)
            .with_context(|| format!("unknown log category '{}'", category))?;
        let level = LogLevel::from_str(level)
            .with_context(|| format!("unknown log level '{}'", level))?;
        logs.set_level(category, level);
    }
    if let Some(path) = &args.log_file {
        logs.set_log_file(path.clone())
            .with_context(|| format!("cannot open log file {}", path.display()))?;
    }
    Ok(())
}

fn cpu_config(args: &Args) -> Result<CpuConfig> {
    let mut config = match &args.config {
        Some(path) => CpuConfig::load(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        None => CpuConfig::default(),
    };
    if let Some(model) = args.model {
        config.model = model.into();
    }
    if args.jit {
        config.jit.enabled = true;
    }
    if args.strict {
        config.fail_on_invalid_opcode = true;
    }
    Ok(config)
}

fn guess_format(path: &Path) -> ImageFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("com") => ImageFormat::Com,
        _ => ImageFormat::Raw,
    }
}

fn load_image(cpu: &mut CfgCpu<Ram>, image: &[u8], format: ImageFormat) -> Result<()> {
    match format {
        ImageFormat::Com => {
            if image.len() > 0xFF00 {
                bail!(".COM image is {} bytes, the limit is 65280", image.len());
            }
            let entry = SegmentedAddress::new(COM_SEGMENT, COM_OFFSET);
            cpu.memory.load_program(entry.linear(), image);
            cpu.state.set_ds(COM_SEGMENT);
            cpu.state.set_es(COM_SEGMENT);
            cpu.state.set_ss(COM_SEGMENT);
            cpu.state.set_sp(0xFFFE);
            cpu.set_entry_point(entry);
        }
        ImageFormat::Raw => {
            if image.len() > 0x10000 {
                bail!("raw image is {} bytes, the limit is 65536", image.len());
            }
            cpu.memory.load_program(BOOT_ADDRESS.linear(), image);
            cpu.state.set_ds(0);
            cpu.state.set_es(0);
            cpu.state.set_ss(0);
            cpu.state.set_sp(BOOT_ADDRESS.offset);
            cpu.set_entry_point(BOOT_ADDRESS);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    configure_logging(&args)?;
    let config = cpu_config(&args)?;

    let image =
        fs::read(&args.image).with_context(|| format!("cannot read {}", args.image.display()))?;
    let format = args.format.unwrap_or_else(|| guess_format(&args.image));

    let mut cpu = CfgCpu::new(Ram::new(), config);
    load_image(&mut cpu, &image, format)?;

    let summary = cpu
        .run(args.max_instructions)
        .with_context(|| format!("emulation stopped at {}", cpu.state.cs_ip()))?;

    let report = RunReport {
        halted: summary.halted,
        instructions: summary.instructions,
        registers: cpu.current_registers(),
        stats: cpu.stats(),
    };
    let json = serde_json::to_string_pretty(&report)?;
    if !args.quiet {
        println!("{}", json);
    }
    if let Some(path) = &args.save {
        let mut f = File::create(path)?;
        write!(f, "{}", json)?;
    }
    Ok(())
}
