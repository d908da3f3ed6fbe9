use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;

use dbl_front::ast::read_ast;
use dbl_front::{astgen, bytecode};
use dbl_x86::elf::write_executable;
use dbl_x86::jit::JitImage;
use dbl_x86::{compile_module, ResolvePolicy};

#[derive(Parser, Debug)]
#[command(name = "dblc")]
#[command(about = "AOT/JIT compiler for the db toy language", long_about = None)]
struct Cli {
    /// Treat INPUT as SoftCPU bytecode and execute it in process.
    #[arg(long)]
    jit: bool,

    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output ELF path (AOT mode).
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.jit {
        let cmds = bytecode::read_bytecode(&cli.input)?;
        let module = bytecode::build_module(&cmds)?;
        debug!("module:\n{module}");
        let image = compile_module(&module, ResolvePolicy::ZeroMissing)?;
        let jit = JitImage::load(&image)?;
        jit.run();
        return Ok(());
    }

    let Some(output) = cli.output.as_deref() else {
        bail!("no output file; use dblc <ast-file> <out-elf>");
    };
    let ast = read_ast(&cli.input)?;
    let module = astgen::build_module(&ast)?;
    debug!("module:\n{module}");
    let mut image = compile_module(&module, ResolvePolicy::Strict)?;
    write_executable(&mut image, output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}
