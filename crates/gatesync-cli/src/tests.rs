use clap::{CommandFactory, Parser};
use gatesync_core::config::SyncTable;
use gatesync_core::models::{
    AccessLog, AccessResult, EventType, NewUser, SyncMetadata, SyncStatus, SyncStatusRow,
    UserStatus, UserType,
};
use gatesync_core::sync::{ConflictResolution, ImportSummary, PeerSyncReport, TableSyncReport};
use gatesync_core::{GateNode, NodeConfig};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::cli::{Cli, Commands, ConflictCommands, UserCommands};
use crate::commands::common::{
    find_user, format_log_lines, format_status_lines, format_timestamp, resolve_node_url,
};
use crate::commands::sync::format_report_lines;
use crate::commands::users::{build_patch, import_file};
use crate::error::CliError;

fn node() -> (tempfile::TempDir, GateNode) {
    let tmp = tempdir().unwrap();
    let mut config = NodeConfig::new(1, 2).unwrap();
    config.db_path = tmp.path().join("node.db");
    let node = GateNode::attach(config).unwrap();
    (tmp, node)
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn resolve_accepts_dashed_resolution_names() {
    let cli = Cli::try_parse_from(["gatesync", "conflicts", "resolve", "7", "accept-remote"]).unwrap();
    match cli.command {
        Commands::Conflicts {
            command: ConflictCommands::Resolve { id, resolution },
        } => {
            assert_eq!(id, 7);
            assert_eq!(resolution, ConflictResolution::AcceptRemote);
        }
        _ => panic!("expected conflicts resolve"),
    }
}

#[test]
fn users_add_parses_original_type_labels() {
    let cli = Cli::try_parse_from([
        "gatesync", "users", "add", "TAG-9", "--name", "Ada", "--type", "VIP",
    ])
    .unwrap();
    match cli.command {
        Commands::Users {
            command: UserCommands::Add {
                rfid_tag, user_type, ..
            },
        } => {
            assert_eq!(rfid_tag, "TAG-9");
            assert_eq!(user_type, UserType::Vip);
        }
        _ => panic!("expected users add"),
    }
    assert!(Cli::try_parse_from(["gatesync", "users", "add", "T", "--type", "Guest"]).is_err());
}

#[test]
fn global_db_path_follows_subcommands() {
    let cli = Cli::try_parse_from(["gatesync", "status", "--db-path", "/tmp/gate.db"]).unwrap();
    assert_eq!(cli.db_path.as_deref(), Some(std::path::Path::new("/tmp/gate.db")));
}

#[test]
fn explicit_node_url_is_trimmed() {
    let url = resolve_node_url(Some(" http://gate-2:8080/ ".to_string()), None).unwrap();
    assert_eq!(url, "http://gate-2:8080");
}

#[test]
fn find_user_accepts_id_or_tag() {
    let (_tmp, node) = node();
    let user = node.recorder().create_user(NewUser::new("TAG-1")).unwrap();

    assert_eq!(find_user(&node, &user.id.to_string()).unwrap().id, user.id);
    assert_eq!(find_user(&node, " TAG-1 ").unwrap().id, user.id);
    assert!(matches!(
        find_user(&node, "TAG-404"),
        Err(CliError::UserNotFound(_))
    ));
}

#[test]
fn build_patch_rejects_empty_update() {
    assert!(matches!(
        build_patch(None, None, None, None),
        Err(CliError::EmptyUpdate)
    ));
    let patch = build_patch(None, Some(UserStatus::Banned), None, None).unwrap();
    assert_eq!(patch.status, Some(UserStatus::Banned));
}

#[test]
fn format_timestamp_renders_utc() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    assert_eq!(format_timestamp(1_700_000_000_000), "2023-11-14 22:13:20");
}

#[test]
fn status_lines_show_error_only_when_present() {
    let failed = SyncStatusRow::new(
        SyncMetadata {
            node_id: 2,
            table: SyncTable::Logs,
            last_sync_at: None,
            last_attempt_at: Some(0),
            status: SyncStatus::Failed,
            error_message: Some("pull: peer 2 unreachable".to_string()),
            pull_cursor: 4,
            last_received_at: None,
        },
        60_000,
    );
    let lines = format_status_lines(&[failed]);
    assert_eq!(
        lines,
        vec![
            "peer 2 logs  FAILED      last sync never, cursor 4\n    error: pull: peer 2 unreachable"
                .to_string()
        ]
    );
}

#[test]
fn log_lines_mark_missing_user() {
    let log = AccessLog {
        id: 1,
        user_id: None,
        event_type: EventType::Denied,
        gate_id: 3,
        booth_id: 2,
        device_id: None,
        created_at: 0,
        result: AccessResult::Fail,
        message: Some("Unknown RFID tag".to_string()),
        node_id: 1,
        synced: false,
        sync_timestamp: None,
    };
    assert_eq!(
        format_log_lines(&[log]),
        vec!["1970-01-01 00:00:00 DENIED FAIL gate 3 booth 2 user - node 1: Unknown RFID tag"]
    );
}

#[test]
fn report_lines_show_failures() {
    let report = PeerSyncReport {
        peer: 2,
        tables: vec![TableSyncReport {
            table: SyncTable::Users,
            pulled: 0,
            applied: 0,
            duplicates: 0,
            conflicts: 0,
            rejected: 0,
            pushed: 0,
            acked: 0,
            error: Some("push: timed out".to_string()),
        }],
    };
    assert_eq!(
        format_report_lines(&[report]),
        vec!["peer 2 users: FAILED push: timed out"]
    );
}

#[test]
fn users_import_takes_a_file_path() {
    let cli = Cli::try_parse_from(["gatesync", "users", "import", "holders.csv"]).unwrap();
    match cli.command {
        Commands::Users {
            command: UserCommands::Import { file },
        } => assert_eq!(file, std::path::PathBuf::from("holders.csv")),
        _ => panic!("expected users import"),
    }
}

#[test]
fn import_file_enrols_rows_through_the_recorder() {
    let (tmp, node) = node();
    let file = tmp.path().join("holders.csv");
    std::fs::write(
        &file,
        "rfid_tag,name,nic,user_type\nTAG-1,Ada,,VIP\nTAG-1,Ada,,VIP\nTAG-2,,,Nobody\n",
    )
    .unwrap();

    let summary = import_file(&node, &file).unwrap();
    assert_eq!(
        summary,
        ImportSummary {
            inserted: 1,
            duplicates: 1,
            invalid: 1,
        }
    );
    assert_eq!(node.queue().pending_count(SyncTable::Users).unwrap(), 1);
    assert_eq!(node.user_by_tag("TAG-1").unwrap().unwrap().user_type, UserType::Vip);

    assert!(matches!(
        import_file(&node, &tmp.path().join("missing.csv")),
        Err(CliError::Io(_))
    ));
}
