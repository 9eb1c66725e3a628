//! `chatweave normalize`: Clean model output read from stdin.

use std::io::Read;

use chatweave_config::AppConfig;
use chatweave_engine::{NormalizeOptions, OutputNormalizer, StopStringBuilder};

pub struct NormalizeArgs {
    pub final_pass: bool,
    pub impersonate: bool,
    pub stops: Vec<String>,
}

pub async fn run(args: NormalizeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;

    let mut stops = StopStringBuilder::from_config(&config).build(args.impersonate);
    for stop in args.stops {
        let stop = unescape(&stop);
        if !stops.contains(&stop) {
            stops.push(stop);
        }
    }

    let normalizer = OutputNormalizer::from_config(&config);
    let options = NormalizeOptions {
        is_impersonate: args.impersonate,
        display_incomplete_sentences: !args.final_pass,
        trim_names: config.output.trim_names,
        ..NormalizeOptions::new(&stops)
    };
    println!("{}", normalizer.normalize(&raw, &options));
    Ok(())
}

/// Turn `\n` escapes into newlines.
fn unescape(s: &str) -> String {
    s.replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_escape() {
        assert_eq!(unescape("\\nUser:"), "\nUser:");
        assert_eq!(unescape("END"), "END");
    }
}
