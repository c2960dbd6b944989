use clap::{Parser, ValueEnum};
use fooocus_metadata::error::WriteError;
use fooocus_metadata::{fooocus, fooocusplus, ruinedfooocus, MetadataWriter};
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Embeds a metadata record, read as JSON from stdin, into a PNG.
#[derive(Parser, Debug)]
#[command(name = "fooocus-embed", version)]
struct Cli {
    /// Log every step.
    #[arg(long)]
    debug: bool,

    /// Layout to write the record in.
    #[arg(short = 't', long = "type", value_enum, default_value_t = EmbedType::Fooocus)]
    kind: EmbedType,

    /// PNG to copy. A blank 1x1 image is used when omitted.
    #[arg(short, long = "in")]
    input: Option<PathBuf>,

    /// PNG to write.
    #[arg(short, long = "out")]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedType {
    Fooocus,
    #[value(name = "fooocusplus")]
    FooocusPlus,
    #[value(name = "ruinedfooocus")]
    RuinedFooocus,
}

fn embed<W>(writer: W, input: Option<&Path>, output: &Path) -> Result<(), WriteError>
where
    W: MetadataWriter,
    W::Metadata: DeserializeOwned,
{
    let metadata: W::Metadata = serde_json::from_reader(io::stdin().lock())?;

    // Read the source fully first: it may be the output file.
    let source = match input {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };

    let mut target = BufWriter::new(File::create(output)?);
    match source {
        Some(png) => writer.copy_write(png.as_slice(), &mut target, &metadata)?,
        None => writer.write(&mut target, &metadata)?,
    }
    target.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let input = cli.input.as_deref();
    let result = match cli.kind {
        EmbedType::Fooocus => embed(fooocus::FooocusWriter, input, &cli.output),
        EmbedType::FooocusPlus => embed(fooocusplus::FooocusPlusWriter, input, &cli.output),
        EmbedType::RuinedFooocus => embed(ruinedfooocus::RuinedFooocusWriter, input, &cli.output),
    };

    match result {
        Ok(()) => {
            println!("Metadata successfully embedded into {}", cli.output.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("Failed to embed metadata into {}: {}", cli.output.display(), err);
            eprintln!("Error: {}", err);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        let cli = Cli::try_parse_from(["fooocus-embed", "--type", "fooocusplus", "--out", "a.png"])
            .unwrap();
        assert_eq!(cli.kind, EmbedType::FooocusPlus);
        assert_eq!(cli.input, None);

        let cli = Cli::try_parse_from(["fooocus-embed", "--out", "a.png", "--in", "b.png"]).unwrap();
        assert_eq!(cli.kind, EmbedType::Fooocus);
        assert_eq!(cli.input, Some(PathBuf::from("b.png")));

        assert!(Cli::try_parse_from(["fooocus-embed", "--type", "ruinedfooocus"]).is_err());
        assert!(Cli::try_parse_from(["fooocus-embed", "-t", "stablediffusion", "-o", "a.png"]).is_err());
    }
}
