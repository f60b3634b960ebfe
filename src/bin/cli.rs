//! serialmq command line interface.

use std::process;
use std::time::Duration;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::style;
use log::{debug, info, trace, LevelFilter};
use simplelog::*;
use tokio::sync::watch;

use serialmq::settings::{parse_data_bits, parse_flow_control, parse_parity, parse_stop_bits};
use serialmq::utils::{list_ports, select_port};
use serialmq::{Bridge, MqttConnector, SerialDevice, SettingsBuilder, SettingsError};

fn cli() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(concat!("v", crate_version!()))
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            serialmq forwards the frames a device sends over a serial port \
            to an MQTT broker, and the messages published for the device \
            back to it.\n\
            \n\
            Frames from the device are published on `<root>/<channel>/out`, \
            messages received on `<root>/<channel>/in` are written to the \
            device. With `--single`, frames carry no channel and the topics \
            are `<root>/out` and `<root>/in`. The bridge announces itself on \
            `<root>/available`: `1` while it runs, `0` once it is gone.\n\
            \n\
            The broker connection is restored whenever it drops. Losing the \
            serial port stops the bridge.\n\
            \n\
            Settings are taken from the defaults, then from the `--config` \
            file, then from the command line.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("CONFIG")
                .help("TOML configuration file")
                .short("-c")
                .long("--config")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LIST_PORTS")
                .help("list the detected serial ports and exit")
                .long("--list-ports"),
        )
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the serial device to use")
                .long_help(
                    "the serial device to use; when not set and running in \
                     a terminal, `serialmq` offers to pick one of the \
                     detected ports.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate [default: 9600]")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character [default: 8]")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte [default: 1]")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol [default: none]")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode [default: none]")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LINE_MODE")
                .help("deliver the serial input line by line")
                .long("--line-mode"),
        )
        .arg(
            Arg::with_name("HOST")
                .help("broker host name or address")
                .short("-H")
                .long("--host")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PORT")
                .help("broker port [default: 1883]")
                .short("-P")
                .long("--port")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("USERNAME")
                .help("broker user name [default: mqtt]")
                .short("-u")
                .long("--username")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PASSWORD")
                .help("broker password [default: mqtt]")
                .long("--password")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("ANONYMOUS")
                .help("connect to the broker without credentials")
                .long("--anonymous")
                .conflicts_with_all(&["USERNAME", "PASSWORD"]),
        )
        .arg(
            Arg::with_name("CLIENT_ID")
                .help("client id presented to the broker [default: serialmq-adapter]")
                .long("--client-id")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("KEEP_ALIVE")
                .help("broker keep alive interval, in seconds [default: 30]")
                .long("--keep-alive")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SINGLE")
                .help("frames carry no channel id")
                .long("--single"),
        )
        .arg(
            Arg::with_name("ROOT")
                .help("root of the bridge topics, e.g. `home/sensors`")
                .short("-r")
                .long("--root")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
}

fn main() {
    let matches = cli().get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'serialmq -v -v -v' or 'serialmq -vvv' vs 'serialmq -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("Failed to initialize the logger!");

    trace!("{:#?}", matches);

    if matches.is_present("LIST_PORTS") {
        list_ports();
        return;
    }

    let mut builder = SettingsBuilder::new();
    if let Some(config) = matches.value_of("CONFIG") {
        builder = builder.load_file(config).unwrap_or_else(|e| fail(e));
    }
    let mut settings = apply_arguments(builder, &matches)
        .unwrap_or_else(|e| fail(e))
        .finalize();

    if settings.path.is_none() {
        settings.path = select_port();
    }
    debug!("{:#?}", settings);

    println!("[MQ] serialmq v{}", crate_version!());

    let exit_code = run(settings);
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

#[tokio::main]
async fn run(settings: serialmq::Settings) -> i32 {
    let (stop, shutdown) = watch::channel(false);
    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        stop.send_replace(true);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let device = Box::new(SerialDevice::new(settings.clone()));
    let bridge = Bridge::new(settings, device, MqttConnector::new(), shutdown);
    match bridge.run().await {
        Ok(()) => {
            info!("Bye");
            0
        }
        Err(e) => {
            eprintln!("{}: {}", style("error").red(), e);
            e.exit_code()
        }
    }
}

/// Command line arguments override whatever the builder already holds.
fn apply_arguments(
    mut builder: SettingsBuilder,
    matches: &ArgMatches,
) -> Result<SettingsBuilder, SettingsError> {
    if let Some(path) = matches.value_of("DEVICE_TTY") {
        builder = builder.path(path);
    }
    if matches.is_present("BAUD_RATE") {
        builder = builder.baud_rate(numeric::<u32>(matches, "BAUD_RATE", "baud-rate")?);
    }
    if matches.is_present("DATA_BITS") {
        builder = builder.data_bits(parse_data_bits(numeric(matches, "DATA_BITS", "data-bits")?)?);
    }
    if matches.is_present("STOP_BITS") {
        builder = builder.stop_bits(parse_stop_bits(numeric(matches, "STOP_BITS", "stop-bits")?)?);
    }
    if let Some(parity) = matches.value_of("PARITY") {
        builder = builder.parity(parse_parity(parity)?);
    }
    if let Some(flow_control) = matches.value_of("FLOW_CONTROL") {
        builder = builder.flow_control(parse_flow_control(flow_control)?);
    }
    if matches.is_present("LINE_MODE") {
        builder = builder.line_mode(true);
    }

    if let Some(host) = matches.value_of("HOST") {
        builder = builder.host(host);
    }
    if matches.is_present("PORT") {
        builder = builder.port(numeric(matches, "PORT", "port")?);
    }
    if matches.is_present("ANONYMOUS") {
        builder = builder.anonymous();
    }
    if let Some(username) = matches.value_of("USERNAME") {
        builder = builder.username(username);
    }
    if let Some(password) = matches.value_of("PASSWORD") {
        builder = builder.password(password);
    }
    if let Some(client_id) = matches.value_of("CLIENT_ID") {
        builder = builder.client_id(client_id);
    }
    if matches.is_present("KEEP_ALIVE") {
        let secs = numeric(matches, "KEEP_ALIVE", "keep-alive")?;
        builder = builder.keep_alive(Duration::from_secs(secs));
    }

    if let Some(root) = matches.value_of("ROOT") {
        builder = builder.root(root);
    }
    if matches.is_present("SINGLE") {
        builder = builder.multiplexed(false);
    }
    Ok(builder)
}

fn numeric<T: std::str::FromStr>(
    matches: &ArgMatches,
    name: &str,
    key: &'static str,
) -> Result<T, SettingsError> {
    value_t!(matches.value_of(name), T).map_err(|_| SettingsError::InvalidValue {
        key,
        value: matches.value_of(name).unwrap_or_default().into(),
    })
}

fn fail(error: SettingsError) -> ! {
    println!("{}: {}", style("error").red(), error);
    process::exit(1);
}
