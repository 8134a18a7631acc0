use dingtalk_sink::event::SOURCE_CONTEXT;
use dingtalk_sink::{Level, LogEvent, SinkConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error};

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("DINGTALK_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid DINGTALK_RELAY_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring provider");
}

/// `[WARN] disk almost full` → (Warning, "disk almost full"). Lines without a
/// recognised prefix are Information.
fn parse_line(line: &str) -> (Level, &str) {
    if let Some(rest) = line.strip_prefix('[')
        && let Some((tag, message)) = rest.split_once(']')
        && let Ok(level) = tag.parse::<Level>()
    {
        return (level, message.trim_start());
    }
    (Level::Information, line)
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = SinkConfig::from_env().unwrap_or_else(|e| fatal("config error", &e));
    let sink = dingtalk_sink::robot(&config).unwrap_or_else(|e| fatal("failed to start sink", &e));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let (level, message) = parse_line(&line);
                    sink.enqueue(
                        LogEvent::new(level, message).with_property(SOURCE_CONTEXT, "stdin"),
                    );
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
        }
    }

    let stats = sink.shutdown().await;
    if stats.dropped > 0 || stats.failed_batches > 0 || stats.abandoned > 0 {
        error!(
            dropped = stats.dropped,
            failed_batches = stats.failed_batches,
            abandoned = stats.abandoned,
            "some events were not delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_prefix() {
        assert_eq!(
            parse_line("[WARN] disk almost full"),
            (Level::Warning, "disk almost full")
        );
        assert_eq!(parse_line("[error]boom"), (Level::Error, "boom"));
    }

    #[test]
    fn unknown_prefix_is_kept_in_message() {
        assert_eq!(
            parse_line("[db] connection reset"),
            (Level::Information, "[db] connection reset")
        );
        assert_eq!(parse_line("plain"), (Level::Information, "plain"));
    }
}
