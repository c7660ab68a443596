use std::path::Path;

/// Initialise the global logger.
///
/// Level defaults to `info` and can be overridden with `RUST_LOG`. When `log_file`
/// is given and can be opened for appending, records go there; otherwise stderr.
pub fn init(log_file: Option<&Path>) {
    use env_logger::Target;
    use std::fs;
    use std::io;

    let target = log_file
        .and_then(|path| {
            (|| -> io::Result<Target> {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Ok(Target::Pipe(Box::new(file)))
            })()
            .ok()
        })
        .unwrap_or(Target::Stderr);

    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(target)
        .try_init();
}
