use anyhow::Result;

fn arch_name(arch: u8) -> String {
    match arch {
        0 => "386".to_string(),
        7 => "68K".to_string(),
        12 => "MIPS".to_string(),
        13 => "ARM".to_string(),
        15 => "PPC".to_string(),
        18 => "SH".to_string(),
        19 => "NET".to_string(),
        23 => "SPARC".to_string(),
        31 => "IA64".to_string(),
        58 => "MSP430".to_string(),
        60 => "DALVIK".to_string(),
        other => format!("ARCH_{}", other),
    }
}

fn bitfield_names(value: u32, names: &[(u32, &str)]) -> String {
    let known: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if known.is_empty() {
        format!("{:#x}", value)
    } else {
        known.join(",")
    }
}

fn file_type_names(file_types: u32) -> String {
    bitfield_names(
        file_types,
        &[(0x04, "BIN"), (0x400, "COFF"), (0x800, "PE"), (0x4000, "ELF")],
    )
}

fn os_type_names(os_types: u16) -> String {
    bitfield_names(
        os_types as u32,
        &[(0x01, "MSDOS"), (0x02, "WIN"), (0x10, "UNIX")],
    )
}

fn app_type_names(app_types: u16) -> String {
    bitfield_names(
        app_types as u32,
        &[(0x04, "EXE"), (0x08, "DLL"), (0x100, "32_BIT"), (0x200, "64_BIT")],
    )
}

fn feature_names(features: u16) -> String {
    if features & 0x10 != 0 {
        "COMPRESSED".to_string()
    } else {
        "none".to_string()
    }
}

fn run(sig_path: &str, show_modules: bool) -> Result<()> {
    let buf = std::fs::read(sig_path)?;
    let buf = if buf.starts_with(&[0x1f, 0x8b]) {
        sigview::sig::unwrap_gzip(&buf)?
    } else {
        buf
    };

    let sig = sigview::sig::parse(&buf)?;
    let header = &sig.header;

    println!("library:    {}", header.library_name);
    println!("version:    {}", header.version);
    println!("arch:       {}", arch_name(header.arch));
    println!("file types: {}", file_type_names(header.file_types));
    println!("os types:   {}", os_type_names(header.os_types));
    println!("app types:  {}", app_type_names(header.app_types));
    println!("features:   {}", feature_names(header.features));
    if let Some(count) = header.extra.functions_count() {
        println!("functions:  {}", count);
    }
    println!("modules:    {}", sig.modules.len());
    println!();

    if show_modules {
        for module in sig.modules.iter() {
            println!("{}", module);
        }
    } else {
        for (index, module, function) in sig.functions() {
            let local = if function.local { "@" } else { " " };
            let collision = if function.collision { "!" } else { " " };
            println!(
                "{:4} {:08x}{}{} {:32} {}",
                index,
                function.offset,
                local,
                collision,
                function.name,
                module.pattern_path_hex()
            );
        }
    }

    Ok(())
}

fn main() {
    better_panic::install();

    let matches = clap::App::new("dumpsig")
        .about("print the contents of a FLIRT .sig signature library")
        .arg(
            clap::Arg::new("verbose")
                .short('v')
                .long("verbose")
                .multiple_occurrences(true)
                .help("log verbose messages"),
        )
        .arg(
            clap::Arg::new("modules")
                .short('m')
                .long("modules")
                .help("print per-module detection rules instead of the function table"),
        )
        .arg(
            clap::Arg::new("sig")
                .required(true)
                .index(1)
                .help("path to .sig or .sig.gz file"),
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
        matches.is_present("modules"),
    ) {
        eprintln!("error: {}", e);
    }
}
