use anyhow::{Context, Result};
use clap::Parser;
use facecheck_core::{Verifier, VerificationResult, VerifyConfig};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "facecheck",
    about = "Verify a selfie against a reference photo",
    long_about = "Reads {\"reference\": <base64>, \"selfie\": <base64>} from stdin and \
                  writes one JSON verification result to stdout."
)]
struct Cli {
    /// TOML config file (FACECHECK_* environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pretty-print the JSON result
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifyRequest {
    reference: String,
    selfie: String,
}

/// Failure before any verification could run.
#[derive(Debug, PartialEq, Serialize)]
struct InputFailure {
    #[serde(rename = "match")]
    matched: bool,
    error: String,
}

impl InputFailure {
    fn new(error: impl std::fmt::Display) -> Self {
        Self {
            matched: false,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Verified(VerificationResult),
    Failed(InputFailure),
}

fn load_config(path: Option<&Path>) -> Result<VerifyConfig> {
    let config = match path {
        Some(p) => VerifyConfig::from_toml_file(p)?,
        None => VerifyConfig::default(),
    };
    let config = config.apply_env();
    config.validate()?;
    Ok(config)
}

fn parse_request(input: &[u8]) -> Result<VerifyRequest> {
    let text = std::str::from_utf8(input).context("input is not valid UTF-8")?;
    let value: serde_json::Value = serde_json::from_str(text)?;
    anyhow::ensure!(value.is_object(), "expected a JSON object");
    Ok(serde_json::from_value(value)?)
}

/// Build the response for one stdin payload. Empty input yields nothing.
fn respond(input: &[u8], config: Result<VerifyConfig>) -> Option<Response> {
    if input.is_empty() {
        tracing::debug!("empty input");
        return None;
    }

    let request = match parse_request(input) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "malformed request");
            return Some(Response::Failed(InputFailure::new(e)));
        }
    };

    let verifier = match config.and_then(|c| Ok(Verifier::new(c)?)) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return Some(Response::Failed(InputFailure::new(e)));
        }
    };

    Some(Response::Verified(verifier.verify(&request.reference, &request.selfie)))
}

/// Read the whole payload from `reader` and respond to it. A read failure is
/// reported like any other bad input.
fn respond_from(mut reader: impl Read, config: Result<VerifyConfig>) -> Option<Response> {
    let mut input = Vec::new();
    if let Err(e) = reader.read_to_end(&mut input) {
        tracing::error!(error = %e, "failed to read stdin");
        return Some(Response::Failed(InputFailure::new(format!("failed to read stdin: {e}"))));
    }
    respond(&input, config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    let Some(response) = respond_from(std::io::stdin().lock(), config) else {
        return Ok(());
    };

    let json = if cli.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::{json, Value};
    use std::io::Cursor;

    fn missing_cascade() -> VerifyConfig {
        VerifyConfig {
            cascade_path: "/nonexistent/facecheck/cascade.xml".into(),
            ..VerifyConfig::default()
        }
    }

    fn to_json(response: Option<Response>) -> Value {
        serde_json::to_value(response.expect("response expected")).unwrap()
    }

    fn png_payload() -> String {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([90, 120, 150])))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        general_purpose::STANDARD.encode(buf.into_inner())
    }

    #[test]
    fn test_empty_input_writes_nothing() {
        assert!(respond(b"", Ok(missing_cascade())).is_none());
    }

    #[test]
    fn test_malformed_json() {
        let v = to_json(respond(b"{not json", Ok(missing_cascade())));
        assert_eq!(v["match"], json!(false));
        assert!(v["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert!(v.get("similarity").is_none());
        assert!(v.get("message").is_none());
    }

    #[test]
    fn test_non_object_json() {
        for input in [&b"[1, 2]"[..], b"\"text\"", b"42", b"null"] {
            let v = to_json(respond(input, Ok(missing_cascade())));
            assert_eq!(v["match"], json!(false));
            assert!(v["error"].is_string());
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let v = to_json(respond(&[0xff, 0xfe, b'{'], Ok(missing_cascade())));
        assert!(v["error"].as_str().unwrap().contains("UTF-8"));
    }

    #[test]
    fn test_missing_fields_fail_decoding() {
        let v = to_json(respond(b"{}", Ok(missing_cascade())));
        assert_eq!(
            v,
            json!({"match": false, "similarity": 0.0, "message": "Could not decode images."})
        );

        let input = format!(r#"{{"reference": "{}"}}"#, png_payload());
        let v = to_json(respond(input.as_bytes(), Ok(missing_cascade())));
        assert_eq!(v["message"], json!("Could not decode images."));
    }

    #[test]
    fn test_missing_cascade_reported_in_error_field() {
        let payload = png_payload();
        let input = json!({"reference": payload, "selfie": payload}).to_string();
        let v = to_json(respond(input.as_bytes(), Ok(missing_cascade())));
        assert_eq!(v["match"], json!(false));
        assert_eq!(v["similarity"], json!(0.0));
        assert!(v["error"].as_str().unwrap().contains("cascade file not found"));
    }

    #[test]
    fn test_config_failure_uses_failure_shape() {
        let bad = VerifyConfig {
            scale_factor: 1.0,
            ..missing_cascade()
        };
        let v = to_json(respond(b"{}", Ok(bad)));
        assert_eq!(v["match"], json!(false));
        assert!(v["error"].is_string());
        assert!(v.get("similarity").is_none());

        let v = to_json(respond(b"{}", Err(anyhow::anyhow!("config unreadable"))));
        assert_eq!(v["error"], json!("config unreadable"));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn test_read_failure_uses_failure_shape() {
        let v = to_json(respond_from(FailingReader, Ok(missing_cascade())));
        assert_eq!(v["match"], json!(false));
        assert!(v["error"].as_str().unwrap().contains("pipe closed"));
        assert!(v.get("similarity").is_none());
    }

    #[test]
    fn test_respond_from_reader() {
        assert!(respond_from(&b""[..], Ok(missing_cascade())).is_none());
        let v = to_json(respond_from(&b"{}"[..], Ok(missing_cascade())));
        assert_eq!(v["message"], json!("Could not decode images."));
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config(Some(Path::new("/nonexistent/facecheck.toml"))).is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["facecheck", "--config", "/etc/facecheck.toml", "--pretty"]);
        assert_eq!(cli.config.as_deref(), Some(Path::new("/etc/facecheck.toml")));
        assert!(cli.pretty);
    }
}
