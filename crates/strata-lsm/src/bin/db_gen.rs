//! Workload generator: fills a database with sequential or YCSB-style keys and optionally
//! drives compaction, exercising the two-tier layout from the command line.

use std::{path::PathBuf, process::ExitCode, time::Instant};

use tracing::level_filters::LevelFilter;

use strata_lsm::{DbMode, Engine, EngineOptions};


const KEY_SIZE: usize = 20;

#[derive(Debug)]
struct Flags {
    num:                   u64,
    value_size:            usize,
    write_buffer_size:     usize,
    bloom_bits:            i64,
    open_files:            u64,
    db:                    Option<PathBuf>,
    hlsm_mode:             DbMode,
    secondary_path:        Option<PathBuf>,
    file_size_mib:         u64,
    level0_size_mb:        u64,
    level_ratio:           u64,
    write_key_from:        i64,
    write_key_upto:        i64,
    ycsb_compatible:       bool,
    extra_files_per_level: u64,
    debug_level:           u32,
    debug_file:            Option<PathBuf>,
    run_compaction:        bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            num:                   1_000_000,
            value_size:            100,
            write_buffer_size:     4 << 20,
            bloom_bits:            -1,
            open_files:            16000,
            db:                    None,
            hlsm_mode:             DbMode::Default,
            secondary_path:        None,
            file_size_mib:         2,
            level0_size_mb:        10,
            level_ratio:           10,
            write_key_from:        0,
            write_key_upto:        -1,
            ycsb_compatible:       false,
            extra_files_per_level: 0,
            debug_level:           0,
            debug_file:            None,
            run_compaction:        false,
        }
    }
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();

    for arg in args {
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument: {arg}"));
        };
        let Some((name, value)) = flag.split_once('=') else {
            return Err(format!("flag without value: {arg}"));
        };

        let int = || value.parse::<i64>().map_err(|_| format!("bad integer in {arg}"));
        let uint = || value.parse::<u64>().map_err(|_| format!("bad integer in {arg}"));
        let boolean = || match value {
            "0" => Ok(false),
            "1" => Ok(true),
            _   => Err(format!("bad boolean in {arg}")),
        };

        match name {
            "num"               => flags.num = uint()?,
            "value_size"        => flags.value_size = uint()? as usize,
            "write_buffer_size" => flags.write_buffer_size = uint()? as usize,
            "bloom_bits"        => flags.bloom_bits = int()?,
            "open_files"        => flags.open_files = uint()?,
            "db"                => flags.db = Some(PathBuf::from(value)),
            "hlsm_mode"         => {
                flags.hlsm_mode = value
                    .parse()
                    .map_err(|()| format!("unknown mode in {arg}"))?;
            }
            "hlsm_secondary_storage_path" => {
                flags.secondary_path = Some(PathBuf::from(value));
            }
            "file_size"             => flags.file_size_mib = uint()?,
            "level0_size"           => flags.level0_size_mb = uint()?,
            "level_ratio"           => flags.level_ratio = uint()?,
            "write_key_from"        => flags.write_key_from = int()?,
            "write_key_upto"        => flags.write_key_upto = int()?,
            "ycsb_compatible"       => flags.ycsb_compatible = boolean()?,
            "extra_files_per_level" => flags.extra_files_per_level = uint()?,
            "debug_level"           => flags.debug_level = uint()? as u32,
            "debug_file"            => flags.debug_file = Some(PathBuf::from(value)),
            "run_compaction"        => flags.run_compaction = boolean()?,
            _                       => return Err(format!("unknown flag: {arg}")),
        }
    }

    Ok(flags)
}

fn install_logging(flags: &Flags) {
    let max_level = match flags.debug_level {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let builder = tracing_subscriber::fmt().with_max_level(max_level);
    if let Some(debug_file) = &flags.debug_file {
        let file = std::fs::File::create(debug_file)
            .expect("cannot create the debug output file");
        builder
            .with_writer(move || file.try_clone().expect("cannot clone the debug file handle"))
            .with_ansi(false)
            .init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

/// 20-byte zero-padded decimal keys, matching the YCSB-compatible layouts the original
/// benchmark produced.
fn make_key(index: i64) -> Vec<u8> {
    let key = format!("{index:0width$}", width = KEY_SIZE);
    key.into_bytes()
}

/// Spread sequential indices over the key space, so inserts arrive in hashed order.
fn ycsb_index(sequential: u64, span: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;
    (sequential.wrapping_mul(GOLDEN_GAMMA)) % span.max(1)
}

fn run(flags: &Flags) -> Result<(), strata_lsm::Error> {
    let db_path = flags.db.clone().unwrap_or_else(|| PathBuf::from("/tmp/strata_gen"));

    let mut options = EngineOptions::new(flags.hlsm_mode, db_path);
    if let Some(secondary) = &flags.secondary_path {
        options = options.with_secondary(secondary.clone());
    }
    options.target_file_size = flags.file_size_mib << 20;
    options.level0_size_mb = flags.level0_size_mb;
    options.level_ratio = flags.level_ratio;
    options.table_cache_capacity = flags.open_files.saturating_sub(10).max(64);
    if flags.bloom_bits >= 0 {
        // The filter policy itself is a collaborator of the table layer; report the probe
        // count its contract derives from the requested bits.
        let probes = strata_lsm::filter::bloom_filter_probes(flags.bloom_bits as u32, None);
        tracing::info!("bloom_bits={} requested ({probes} probes)", flags.bloom_bits);
    }

    let engine = Engine::open(options)?;

    let span_upto = if flags.write_key_upto < 0 {
        flags.write_key_from + flags.num as i64
    } else {
        flags.write_key_upto
    };
    let span = (span_upto - flags.write_key_from).max(1) as u64;

    let mut rng = oorandom::Rand64::new(301);
    let mut batch: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
    let mut batch_bytes = 0_usize;
    let started = Instant::now();

    for sequential in 0..flags.num {
        let offset = if flags.ycsb_compatible {
            ycsb_index(sequential, span)
        } else {
            sequential % span
        };
        let key = make_key(flags.write_key_from + offset as i64);

        let mut value = vec![0_u8; flags.value_size];
        for chunk in value.chunks_mut(8) {
            let random = rng.rand_u64().to_le_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&random[..len]);
        }

        batch_bytes += key.len() + value.len();
        batch.push((key, Some(value)));

        if batch_bytes >= flags.write_buffer_size {
            engine.flush_batch(std::mem::take(&mut batch))?;
            batch_bytes = 0;
        }
    }
    if !batch.is_empty() {
        engine.flush_batch(batch)?;
    }

    // Seed additional level-0 tables so compaction has work from the start.
    for extra in 0..flags.extra_files_per_level {
        let key_low = make_key(flags.write_key_from);
        let key_high = make_key(flags.write_key_from + span as i64 - 1);
        engine.flush_batch(vec![
            (key_low, Some(vec![extra as u8; flags.value_size.max(1)])),
            (key_high, Some(vec![extra as u8; flags.value_size.max(1)])),
        ])?;
    }

    if flags.run_compaction {
        engine.compact_until_quiet()?;
    }
    engine.wait_pipeline_idle();

    let elapsed = started.elapsed();
    println!(
        "wrote {} entries ({} value bytes each) in {:.3}s; last sequence {}",
        flags.num,
        flags.value_size,
        elapsed.as_secs_f64(),
        engine.last_sequence(),
    );

    engine.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flags = match parse_flags(&args) {
        Ok(flags) => flags,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    install_logging(&flags);

    match run(&flags) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("db_gen failed: {error}");
            ExitCode::FAILURE
        }
    }
}
