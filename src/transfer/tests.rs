//! Unit tests for rsync command construction and outcome handling.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};

use super::*;
use crate::session::HostKeyPolicy;
use crate::test_support::{ScriptedRunner, key_client, password_client, rsync_stats};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn mirror(runner: &ScriptedRunner) -> Mirror {
    Mirror::new(
        String::from("rsync"),
        SshTransport {
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            known_hosts_file: Utf8PathBuf::from("/data/known_hosts"),
            host_key_policy: HostKeyPolicy::AcceptAny,
            connect_timeout_secs: 10,
        },
        Arc::new(runner.clone()),
    )
}

fn pull<'a>(link_dest: Option<&'a Utf8Path>) -> Pull<'a> {
    Pull {
        source: Utf8Path::new("/var/www"),
        destination: Utf8Path::new("/data/backups/job-1/20260601T013000Z-run-1"),
        link_dest,
    }
}

#[rstest]
fn pull_mirrors_with_deletes_and_excludes(runner: ScriptedRunner) {
    let command = mirror(&runner).pull_command(&key_client(1, false), pull(None));
    let rendered = command.display_string();

    assert!(rendered.starts_with("rsync -a --stats --protect-args -e ssh -p 2222"));
    assert!(command.arguments().iter().any(|arg| arg == "--delete"));
    assert!(command.arguments().iter().any(|arg| arg == "--exclude=*.tmp"));
    assert!(rendered.ends_with(
        "backup@files.example.test:/var/www/ /data/backups/job-1/20260601T013000Z-run-1/"
    ));
    assert!(!rendered.contains("--rsync-path"));
    assert!(!rendered.contains("--link-dest"));
}

#[rstest]
fn pull_links_against_previous_snapshot_and_elevates(runner: ScriptedRunner) {
    let previous = Utf8PathBuf::from("/data/backups/job-1/20260531T013000Z-run-0");
    let command =
        mirror(&runner).pull_command(&key_client(1, true), pull(Some(previous.as_path())));
    let args: Vec<String> = command
        .arguments()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    assert!(args.contains(&String::from("--rsync-path=sudo rsync")));
    assert!(args.contains(&format!("--link-dest={previous}")));
}

#[rstest]
fn password_transfers_wrap_rsync_in_sshpass(runner: ScriptedRunner) {
    let command = mirror(&runner).pull_command(&password_client(1, "letmein"), pull(None));

    assert_eq!(command.program(), "sshpass");
    assert!(command.display_string().starts_with("sshpass -e rsync -a"));
    assert_eq!(command.env_keys().collect::<Vec<_>>(), vec!["SSHPASS"]);
    assert!(!command.display_string().contains("letmein"));
}

#[rstest]
fn push_never_deletes_and_supports_dry_run(runner: ScriptedRunner) {
    let command = mirror(&runner).push_command(
        &key_client(1, false),
        Push {
            snapshot: Utf8Path::new("/data/backups/job-1/snap"),
            destination: Utf8Path::new("/restore/here"),
            dry_run: true,
        },
    );
    let rendered = command.display_string();

    assert!(!rendered.contains("--delete"));
    assert!(rendered.contains("--dry-run"));
    assert!(rendered.ends_with("/data/backups/job-1/snap/ backup@files.example.test:/restore/here"));
}

#[rstest]
fn successful_pull_reports_stats(runner: ScriptedRunner) {
    runner.push_output(Some(0), rsync_stats(42, 1_234_567), "");

    let report = mirror(&runner)
        .pull(&key_client(1, false), pull(None))
        .expect("pull should succeed");

    assert_eq!(report.stats.regular_files, Some(42));
    assert_eq!(report.stats.total_bytes, Some(1_234_567));
    assert!(report.warning.is_none());
}

#[rstest]
fn vanished_files_complete_with_warning(runner: ScriptedRunner) {
    runner.push_output(
        Some(RSYNC_VANISHED),
        rsync_stats(3, 300),
        "file has vanished: \"/var/www/cache/x\"",
    );

    let report = mirror(&runner)
        .pull(&key_client(1, false), pull(None))
        .expect("vanished files are tolerated");

    assert!(
        report
            .warning
            .as_deref()
            .is_some_and(|text| text.contains("vanished"))
    );
    assert_eq!(report.stats.regular_files, Some(3));
}

#[rstest]
#[case::partial(Some(23), "rsync error: some files could not be transferred (code 23)")]
#[case::protocol(Some(12), "rsync error: error in rsync protocol data stream (code 12)")]
fn other_statuses_fail_with_diagnostic(
    runner: ScriptedRunner,
    #[case] code: Option<i32>,
    #[case] stderr: &str,
) {
    runner.push_output(code, "", stderr);

    let err = mirror(&runner)
        .pull(&key_client(1, false), pull(None))
        .expect_err("pull should fail");

    assert_eq!(
        err,
        TransferError::Failed {
            code,
            status: code.map(|value| value.to_string()).unwrap_or_default(),
            detail: stderr.to_owned(),
        }
    );
}

#[rstest]
#[case::protocol_startup(5, "rsync error: error starting client-server protocol (code 5) at main.c(1863) [Receiver=3.2.7]")]
#[case::daemon_log(6, "rsync error: daemon unable to append to log-file (code 6) at log.c(245) [Receiver=3.2.7]")]
fn rsync_statuses_shared_with_sshpass_stay_transfer_failures(
    runner: ScriptedRunner,
    #[case] code: i32,
    #[case] stderr: &str,
) {
    runner.push_output(Some(code), "", stderr);

    let err = mirror(&runner)
        .pull(&password_client(1, "pw"), pull(None))
        .expect_err("pull should fail");

    assert!(
        matches!(err, TransferError::Failed { code: Some(found), .. } if found == code),
        "unexpected error: {err}"
    );
}

#[rstest]
fn silent_sshpass_host_key_refusal_is_reported(runner: ScriptedRunner) {
    runner.push_output(Some(6), "", "");

    let err = mirror(&runner)
        .pull(&password_client(1, "pw"), pull(None))
        .expect_err("pull should fail");

    assert!(matches!(
        err,
        TransferError::Session(SessionError::HostKeyRejected { .. })
    ));
}

#[rstest]
fn ssh_failures_inside_rsync_map_to_session_errors(runner: ScriptedRunner) {
    runner.push_output(Some(5), "", "");
    runner.push_output(
        Some(255),
        "",
        "ssh: connect to host files.example.test port 2222: No route to host\n\
         rsync: connection unexpectedly closed (0 bytes received so far) [Receiver]",
    );

    let auth = mirror(&runner).pull(&password_client(1, "pw"), pull(None));
    let network = mirror(&runner).pull(&key_client(1, false), pull(None));

    assert!(matches!(
        auth,
        Err(TransferError::Session(SessionError::Auth { .. }))
    ));
    assert!(matches!(
        network,
        Err(TransferError::Session(SessionError::Network { .. }))
    ));
}

#[rstest]
#[case::modern("Number of files: 1,204 (reg: 1,100, dir: 100, link: 4)\nTotal file size: 9,876,543 bytes\n", Some(1100), Some(9_876_543))]
#[case::directories_only("Number of files: 3 (dir: 3)\nTotal file size: 0 bytes\n", Some(0), Some(0))]
#[case::legacy("Number of files: 17\nTotal file size: 2048 bytes\n", Some(17), Some(2048))]
#[case::missing("sent 10 bytes  received 20 bytes\n", None, None)]
fn stats_parser_handles_rsync_versions(
    #[case] stdout: &str,
    #[case] files: Option<u64>,
    #[case] bytes: Option<u64>,
) {
    let stats = TransferStats::parse(stdout);
    assert_eq!(stats.regular_files, files);
    assert_eq!(stats.total_bytes, bytes);
}
