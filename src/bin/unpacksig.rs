use anyhow::Result;

fn run(sig_path: &str, output_path: &str) -> Result<()> {
    let buf = std::fs::read(sig_path)?;
    let buf = if buf.starts_with(&[0x1f, 0x8b]) {
        sigview::sig::unwrap_gzip(&buf)?
    } else {
        buf
    };

    std::fs::write(output_path, sigview::sig::unpack(&buf)?)?;

    Ok(())
}

fn main() {
    better_panic::install();

    let matches = clap::App::new("unpacksig")
        .about("rewrite a compressed (or gzipped) FLIRT .sig file as an uncompressed one")
        .arg(
            clap::Arg::new("verbose")
                .short('v')
                .long("verbose")
                .multiple_occurrences(true)
                .help("log verbose messages"),
        )
        .arg(
            clap::Arg::new("sig")
                .required(true)
                .index(1)
                .help("path to .sig or .sig.gz file"),
        )
        .arg(
            clap::Arg::new("output")
                .required(true)
                .index(2)
                .help("path to output file"),
        )
        .get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{:5}] {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                if log_level == log::LevelFilter::Trace {
                    record.target()
                } else {
                    ""
                },
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()
        .expect("failed to configure logging");

    if let Err(e) = run(
        matches.value_of("sig").unwrap(),
        matches.value_of("output").unwrap(),
    ) {
        eprintln!("error: {}", e);
    }
}
