use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Arg;
use clap::ArgAction;
use clap::Command;
use clap::crate_version;
use fuser::Config;
use fuser::MountOption;
use fuser::SessionACL;
use log::LevelFilter;
use log::error;
use razorfs::RazorFs;
use razorfs::Settings;

fn main() -> ExitCode {
    let matches = Command::new("razorfs")
        .version(crate_version!())
        .about("In-memory FUSE filesystem backed by shared memory and a write-ahead log")
        .arg(
            Arg::new("mount-point")
                .value_name("MOUNT_POINT")
                .required(true)
                .help("Directory to mount the filesystem on"),
        )
        .arg(
            Arg::new("region-name")
                .long("region-name")
                .value_name("NAME")
                .default_value("razorfs")
                .help("Shared-memory region identifier"),
        )
        .arg(
            Arg::new("node-capacity")
                .long("node-capacity")
                .value_name("NODES")
                .value_parser(clap::value_parser!(u32))
                .default_value("16384")
                .help("Node arena capacity when creating a region"),
        )
        .arg(
            Arg::new("string-capacity")
                .long("string-capacity")
                .value_name("BYTES")
                .value_parser(clap::value_parser!(u32))
                .default_value("1048576")
                .help("String table capacity when creating a region"),
        )
        .arg(
            Arg::new("data-capacity")
                .long("data-capacity")
                .value_name("BYTES")
                .value_parser(clap::value_parser!(u64))
                .default_value("67108864")
                .help("Payload block pool capacity when creating a region"),
        )
        .arg(
            Arg::new("wal")
                .long("wal")
                .value_name("PATH")
                .help("Write-ahead log path; omit to run without durability"),
        )
        .arg(
            Arg::new("compression-threshold")
                .long("compression-threshold")
                .value_name("BYTES")
                .value_parser(clap::value_parser!(u32))
                .default_value("65536")
                .help("Files below this size are never compressed"),
        )
        .arg(
            Arg::new("rebalance-interval")
                .long("rebalance-interval")
                .value_name("MUTATIONS")
                .value_parser(clap::value_parser!(u64))
                .default_value("0")
                .help("Mutations between automatic rebalances; 0 disables"),
        )
        .arg(
            Arg::new("auto-unmount")
                .long("auto-unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount when the process exits"),
        )
        .arg(
            Arg::new("allow-other")
                .long("allow-other")
                .action(ArgAction::SetTrue)
                .help("Allow other users to access the mount"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .get_matches();

    let verbosity = matches.get_count("v");
    let log_level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let settings = Settings {
        region_name: matches.get_one::<String>("region-name").unwrap().clone(),
        node_capacity: *matches.get_one::<u32>("node-capacity").unwrap(),
        string_capacity: *matches.get_one::<u32>("string-capacity").unwrap(),
        data_capacity: *matches.get_one::<u64>("data-capacity").unwrap(),
        wal_path: matches.get_one::<String>("wal").map(PathBuf::from),
        compression_threshold: *matches.get_one::<u32>("compression-threshold").unwrap(),
        rebalance_interval: *matches.get_one::<u64>("rebalance-interval").unwrap(),
    };

    let fs = match RazorFs::new(settings) {
        Ok(fs) => fs,
        Err(err) => {
            error!("initialization failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut options = vec![MountOption::FSName("razorfs".to_string())];
    if matches.get_flag("auto-unmount") {
        options.push(MountOption::AutoUnmount);
    }
    let acl = if matches.get_flag("allow-other") {
        SessionACL::All
    } else {
        SessionACL::Owner
    };

    let mut config = Config::default();
    config.mount_options = options;
    config.acl = acl;

    let mountpoint: String = matches.get_one::<String>("mount-point").unwrap().clone();
    match fuser::mount2(fs, &mountpoint, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // EPERM here usually means user_allow_other is missing from
            // /etc/fuse.conf.
            error!("{err}");
            if err.kind() == ErrorKind::PermissionDenied {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
