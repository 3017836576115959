use anyhow::Result;

fn main() -> Result<()> {
    let code = execbox::cli::run()?;
    std::process::exit(code)
}
