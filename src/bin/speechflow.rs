use clap::Parser;

use speechflow::cli::RunOptions;

#[derive(Parser)]
#[command(name = "speechflow")]
#[command(about = "Transcribe one audio file through the speech pipeline")]
#[command(version)]
struct Args {
    /// Audio file to transcribe
    file: std::path::PathBuf,

    /// Declared content type, e.g. audio/mpeg
    #[arg(long)]
    content_type: Option<String>,

    /// Force a recognition locale, e.g. fr-FR (default: auto-detect)
    #[arg(long, short = 'l')]
    language: Option<String>,

    /// Path to environment file
    #[arg(long)]
    envfile: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let options = RunOptions {
        envfile: args.envfile,
        file: args.file,
        content_type: args.content_type,
        language: args.language,
    };

    let code = speechflow::run(options).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
