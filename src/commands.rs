use std::io::IsTerminal;
use std::path::PathBuf;

use argh::FromArgs;
use conntrack::client::{self, Client};
use conntrack::config::Config;
use exitcode::ExitCode;
use netlink_packet_conntrack::{
    AttributeKind, ConnAttr, Family, FilterEntry, Instruction, Table, compile,
};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
#[argh(
    description = "Inspect and manipulate the kernel connection tracking table",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"warn\".to_string()",
        description = "log level, overridden by the CONNTRACK_LOG env"
    )]
    log_level: String,

    #[argh(
        option,
        short = 'c',
        long = "config",
        description = "read default family, table and filters from a YAML file"
    )]
    config: Option<PathBuf>,

    #[argh(subcommand)]
    sub_commands: Option<SubCommands>,
}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("conntrack {}", env!("CARGO_PKG_VERSION"));
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let Some(sub_command) = &self.sub_commands else {
            eprintln!("a subcommand is required, run with --help to list them");
            return Err(exitcode::USAGE);
        };

        let log_level = std::env::var("CONNTRACK_LOG").unwrap_or(self.log_level.clone());
        init_tracing(&log_level)?;

        let config = match &self.config {
            Some(path) => Config::load(path).map_err(|err| {
                error!(message = "load config failed", ?path, %err);
                exitcode::CONFIG
            })?,
            None => Config::default(),
        };

        // everything the user typed is checked before a socket is opened
        let action = sub_command.prepare(&config)?;
        if let Action::PrintFilter(program) = &action {
            for ins in program {
                println!("{ins}");
            }
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(|err| {
                error!(message = "build tokio runtime failed", %err);
                exitcode::OSERR
            })?;

        runtime.block_on(action.execute())
    }
}

fn init_tracing(level: &str) -> Result<(), ExitCode> {
    let filter = EnvFilter::try_new(level).map_err(|err| {
        eprintln!("invalid log level {level:?}, {err}");
        exitcode::USAGE
    })?;

    // a subscriber may already be installed when embedded, that's fine
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    Ok(())
}

#[derive(Debug, FromArgs)]
#[argh(
    subcommand,
    name = "flush",
    description = "Remove every entry of a table",
    help_triggers("-h", "--help")
)]
struct Flush {
    #[argh(option, short = 'f', description = "address family, ipv4, ipv6 or unspec")]
    family: Option<Family>,

    #[argh(option, short = 't', description = "table, conntrack, expect or timeout")]
    table: Option<Table>,
}

#[derive(Debug, FromArgs)]
#[argh(
    subcommand,
    name = "dump",
    description = "List entries, one per line",
    help_triggers("-h", "--help")
)]
struct Dump {
    #[argh(option, short = 'f', description = "address family, ipv4, ipv6 or unspec")]
    family: Option<Family>,

    #[argh(option, short = 't', description = "table, conntrack, expect or timeout")]
    table: Option<Table>,

    #[argh(
        option,
        long = "filter",
        description = "only show entries matching kind=value or kind!=value, an optional /mask may follow the value. Repeating a kind matches any of its values"
    )]
    filters: Vec<String>,

    #[argh(switch, description = "print the compiled filter program and exit")]
    print_filter: bool,
}

#[derive(Debug, FromArgs)]
#[argh(
    subcommand,
    name = "create",
    description = "Insert a new entry",
    help_triggers("-h", "--help")
)]
struct Create {
    #[argh(option, short = 'f', description = "address family, ipv4, ipv6 or unspec")]
    family: Option<Family>,

    #[argh(option, description = "seconds until the entry expires")]
    timeout: Option<u32>,

    #[argh(positional, description = "attributes of the entry, as kind=value")]
    attrs: Vec<String>,
}

#[derive(Debug, FromArgs)]
#[argh(
    subcommand,
    name = "delete",
    description = "Remove a single entry",
    help_triggers("-h", "--help")
)]
struct Delete {
    #[argh(option, short = 'f', description = "address family, ipv4, ipv6 or unspec")]
    family: Option<Family>,

    #[argh(positional, description = "attributes identifying the entry, as kind=value")]
    attrs: Vec<String>,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum SubCommands {
    Flush(Flush),
    Dump(Dump),
    Create(Create),
    Delete(Delete),
}

impl SubCommands {
    fn prepare(&self, config: &Config) -> Result<Action, ExitCode> {
        match self {
            SubCommands::Flush(flush) => Ok(Action::Flush {
                table: flush.table.unwrap_or(config.table),
                family: flush.family.unwrap_or(config.family),
            }),
            SubCommands::Dump(dump) => {
                let table = dump.table.unwrap_or(config.table);
                let mut filters = config.filters().map_err(|err| {
                    error!(message = "invalid filter in config", %err);
                    exitcode::CONFIG
                })?;
                for expr in &dump.filters {
                    let entry = expr.parse::<FilterEntry>().map_err(|err| {
                        error!(message = "invalid filter", %expr, %err);
                        exitcode::USAGE
                    })?;
                    filters.push(entry);
                }

                let program = compile(table, &filters).map_err(|err| {
                    error!(message = "compile filter failed", %err);
                    exitcode::USAGE
                })?;
                debug!(message = "filter compiled", instructions = program.len());

                if dump.print_filter {
                    return Ok(Action::PrintFilter(program));
                }

                Ok(Action::Dump {
                    table,
                    family: dump.family.unwrap_or(config.family),
                    filters,
                })
            }
            SubCommands::Create(create) => {
                let mut attrs = parse_attributes(&create.attrs)?;
                if let Some(timeout) = create.timeout {
                    attrs.push(ConnAttr::u32(AttributeKind::Timeout, timeout));
                }

                Ok(Action::Create {
                    family: create.family.unwrap_or(config.family),
                    attrs,
                })
            }
            SubCommands::Delete(delete) => Ok(Action::Delete {
                family: delete.family.unwrap_or(config.family),
                attrs: parse_attributes(&delete.attrs)?,
            }),
        }
    }
}

fn parse_attributes(exprs: &[String]) -> Result<Vec<ConnAttr>, ExitCode> {
    if exprs.is_empty() {
        error!(message = "at least one kind=value attribute is required");
        return Err(exitcode::USAGE);
    }

    exprs
        .iter()
        .map(|expr| {
            let (kind, value) = expr.split_once('=').ok_or_else(|| {
                error!(message = "attribute must look like kind=value", %expr);
                exitcode::USAGE
            })?;

            kind.trim()
                .parse::<AttributeKind>()
                .and_then(|kind| ConnAttr::parse(kind, value))
                .map_err(|err| {
                    error!(message = "invalid attribute", %expr, %err);
                    exitcode::USAGE
                })
        })
        .collect()
}

/// A validated request, ready to run.
enum Action {
    Flush {
        table: Table,
        family: Family,
    },
    Dump {
        table: Table,
        family: Family,
        filters: Vec<FilterEntry>,
    },
    Create {
        family: Family,
        attrs: Vec<ConnAttr>,
    },
    Delete {
        family: Family,
        attrs: Vec<ConnAttr>,
    },
    PrintFilter(Vec<Instruction>),
}

impl Action {
    #![allow(clippy::print_stdout)]
    async fn execute(self) -> Result<(), ExitCode> {
        let client = Client::open().await.map_err(|err| {
            error!(message = "open netlink socket failed", %err);
            exit_code(&err)
        })?;

        let result = match self {
            Action::Flush { table, family } => client.flush(table, family).await,
            Action::Dump {
                table,
                family,
                filters,
            } => {
                let result = if filters.is_empty() {
                    client.dump(table, family).await
                } else {
                    client.dump_filter(table, family, &filters).await
                };

                result.map(|records| {
                    for record in &records {
                        println!("{record}");
                    }
                    eprintln!("{} flow entries have been shown.", records.len());
                })
            }
            Action::Create { family, attrs } => {
                client.create(Table::Conntrack, family, &attrs).await
            }
            Action::Delete { family, attrs } => {
                client.delete(Table::Conntrack, family, &attrs).await
            }
            Action::PrintFilter(_) => Ok(()),
        };

        client.close();

        result.map_err(|err| {
            error!(message = "request failed", %err);
            exit_code(&err)
        })
    }
}

fn exit_code(err: &client::Error) -> ExitCode {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => exitcode::NOPERM,
        _ => match err {
            client::Error::Io(_) => exitcode::IOERR,
            _ => exitcode::SOFTWARE,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(args: &[&str]) -> RootCommand {
        RootCommand::from_args(&["conntrack"], args).unwrap()
    }

    fn prepare(args: &[&str], config: &Config) -> Result<Action, ExitCode> {
        match root(args).sub_commands {
            Some(sub_command) => sub_command.prepare(config),
            None => panic!("no subcommand in {args:?}"),
        }
    }

    #[test]
    fn flags_override_config() {
        let config: Config = "family: ipv6\ntable: expect\n".parse().unwrap();

        match prepare(&["flush"], &config).unwrap() {
            Action::Flush { table, family } => {
                assert_eq!(table, Table::Expected);
                assert_eq!(family, Family::Ipv6);
            }
            _ => panic!("expect flush"),
        }

        match prepare(&["flush", "-f", "ipv4", "-t", "conntrack"], &config).unwrap() {
            Action::Flush { table, family } => {
                assert_eq!(table, Table::Conntrack);
                assert_eq!(family, Family::Ipv4);
            }
            _ => panic!("expect flush"),
        }
    }

    #[test]
    fn config_filters_come_first() {
        let config: Config = "filters:\n  - kind: orig_l4_proto\n    value: 17\n"
            .parse()
            .unwrap();

        match prepare(&["dump", "--filter", "orig_port_dst=53"], &config).unwrap() {
            Action::Dump { filters, .. } => assert_eq!(
                filters,
                vec![
                    FilterEntry::new(AttributeKind::OrigL4Proto, vec![17]),
                    FilterEntry::new(AttributeKind::OrigPortDst, vec![0, 53]),
                ]
            ),
            _ => panic!("expect dump"),
        }
    }

    #[test]
    fn print_filter() {
        match prepare(&["dump", "--filter", "mark=1", "--print-filter"], &Config::default())
            .unwrap()
        {
            Action::PrintFilter(program) => {
                assert_eq!(program.last().map(|ins| ins.k), Some(0));
            }
            _ => panic!("expect print filter"),
        }
    }

    #[test]
    fn invalid_input() {
        let config = Config::default();

        for args in [
            &["dump", "--filter", "orig_l4_proto"][..],
            &["dump", "--filter", "nope=1"],
            &["dump", "--filter", "orig_port_dst=70000"],
            &["dump", "--filter", "orig_counter_bytes=1"],
            &["create"],
            &["create", "timeout"],
            &["delete", "orig_ipv4_src=1.2.3"],
        ] {
            assert!(
                matches!(prepare(args, &config), Err(exitcode::USAGE)),
                "{args:?}"
            );
        }
    }

    #[test]
    fn create_with_timeout() {
        match prepare(
            &["create", "--timeout", "100", "orig_l4_proto=6", "tcp_state=1"],
            &Config::default(),
        )
        .unwrap()
        {
            Action::Create { family, attrs } => {
                assert_eq!(family, Family::Ipv4);
                assert_eq!(
                    attrs,
                    vec![
                        ConnAttr::u8(AttributeKind::OrigL4Proto, 6),
                        ConnAttr::u8(AttributeKind::TcpState, 1),
                        ConnAttr::u32(AttributeKind::Timeout, 100),
                    ]
                );
            }
            _ => panic!("expect create"),
        }
    }

    #[test]
    fn exit_codes() {
        let err = client::Error::Io(std::io::Error::from_raw_os_error(libc::EPERM));
        assert_eq!(exit_code(&err), exitcode::NOPERM);

        let err = client::Error::Io(std::io::Error::from_raw_os_error(libc::ENOBUFS));
        assert_eq!(exit_code(&err), exitcode::IOERR);

        let err = client::Error::Protocol(netlink_packet_conntrack::Error::KernelReported {
            code: -libc::EPERM,
        });
        assert_eq!(exit_code(&err), exitcode::NOPERM);

        let err = client::Error::Protocol(netlink_packet_conntrack::Error::KernelReported {
            code: -libc::EEXIST,
        });
        assert_eq!(exit_code(&err), exitcode::SOFTWARE);
    }
}
