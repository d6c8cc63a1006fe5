//! Target and Control conductors talking over loopback in one thread.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use draupnir_control::{ControlConductor, ControlConfig, ESCAPE_BYTE};
use draupnir_core::tls::TlsPolicy;
use draupnir_core::CredentialStore;
use draupnir_target::{ShellConfig, TargetConductor, TargetConfig};
use tracing::Span;
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(10);
const MAX_TURNS: usize = 1000;

type Control = ControlConductor<UnixStream, Vec<u8>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_target(store: &CredentialStore) -> TargetConductor {
    let config = TargetConfig {
        listen: vec!["127.0.0.1:0".parse().unwrap()],
        shell: ShellConfig {
            program: Some("/bin/sh".into()),
            ..Default::default()
        },
        tls: TlsPolicy::default(),
    };
    TargetConductor::start(&config, store, Span::none()).unwrap()
}

/// Connect a Control whose console is the returned socket.
fn connect(target: &TargetConductor, store: &CredentialStore) -> (Control, UnixStream) {
    let addr = target.local_addr().unwrap();
    let config = ControlConfig {
        target: addr.to_string(),
        peer: vec![addr],
        tls: TlsPolicy::default(),
        raw_mode: false,
    };
    let (console, keyboard) = UnixStream::pair().unwrap();
    console.set_nonblocking(true).unwrap();
    let control = ControlConductor::connect(&config, store, console, Vec::new(), Span::none()).unwrap();
    (control, keyboard)
}

fn output(control: &Control) -> String {
    String::from_utf8_lossy(control.output()).into_owned()
}

/// Turn both loops until `done` holds.
fn drive(
    target: &mut TargetConductor,
    control: &mut Control,
    mut done: impl FnMut(&TargetConductor, &Control) -> bool,
) -> bool {
    for _ in 0..MAX_TURNS {
        if done(target, control) {
            return true;
        }
        target.turn(Some(TICK)).unwrap();
        if !control.is_closed() {
            control.turn(Some(TICK)).unwrap();
        }
    }
    done(target, control)
}

fn drive_target(target: &mut TargetConductor, mut done: impl FnMut(&TargetConductor) -> bool) -> bool {
    for _ in 0..MAX_TURNS {
        if done(target) {
            return true;
        }
        target.turn(Some(TICK)).unwrap();
    }
    done(target)
}

/// Ask the remote shell for its pid.
fn shell_pid(target: &mut TargetConductor, control: &mut Control, keyboard: &mut UnixStream) -> u32 {
    keyboard.write_all(b"echo shell-pid:$$:\n").unwrap();
    let mut pid = None;
    assert!(drive(target, control, |_, c| {
        pid = parse_pid(&output(c));
        pid.is_some()
    }));
    pid.unwrap()
}

fn parse_pid(text: &str) -> Option<u32> {
    text.split("shell-pid:")
        .skip(1)
        .find_map(|rest| rest.split(':').next()?.parse().ok())
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

#[test]
fn banner_names_host_and_user() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, _keyboard) = connect(&target, &store);

    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));
    assert!(control.is_active());

    let banner = output(&control);
    assert!(banner.starts_with("Draupnir target version"));
    assert!(banner.contains(&hostname()), "banner: {banner:?}");
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .unwrap()
        .map(|u| u.name)
        .unwrap_or_else(|| nix::unistd::getuid().to_string());
    assert!(banner.contains(&user), "banner: {banner:?}");
}

#[test]
fn keystrokes_reach_the_shell_and_output_comes_back() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, mut keyboard) = connect(&target, &store);
    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));

    keyboard.write_all(b"echo draupnir-$((40+2))\n").unwrap();
    assert!(
        drive(&mut target, &mut control, |_, c| output(c).contains("draupnir-42")),
        "output: {:?}",
        output(&control)
    );
    assert_eq!(target.session_count(), 1);
    assert_eq!(target.registration_count(), 2);
}

#[test]
fn sequential_sessions_leave_no_registrations() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);

    for _ in 0..4 {
        let (mut control, mut keyboard) = connect(&target, &store);
        assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));
        assert_eq!(target.session_count(), 1);

        keyboard.write_all(&[ESCAPE_BYTE]).unwrap();
        assert!(drive(&mut target, &mut control, |t, c| c.is_closed()
            && t.session_count() == 0));
    }
    assert_eq!(target.session_count(), 0);
    assert_eq!(target.registration_count(), 0);
}

#[test]
fn control_hangup_tears_down_the_session() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, mut keyboard) = connect(&target, &store);
    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));
    assert_eq!(target.registration_count(), 2);
    let pid = shell_pid(&mut target, &mut control, &mut keyboard);
    assert!(Path::new(&format!("/proc/{pid}")).exists());

    drop(control);
    drop(keyboard);
    assert!(drive_target(&mut target, |t| t.session_count() == 0));
    assert_eq!(target.registration_count(), 0);
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
}

#[test]
fn escape_reaps_the_shell() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, mut keyboard) = connect(&target, &store);
    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));
    let pid = shell_pid(&mut target, &mut control, &mut keyboard);

    keyboard.write_all(&[ESCAPE_BYTE]).unwrap();
    assert!(drive(&mut target, &mut control, |t, c| c.is_closed()
        && t.session_count() == 0));
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
}

#[test]
fn shell_exit_closes_the_control_side() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, mut keyboard) = connect(&target, &store);
    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));

    keyboard.write_all(b"exit\n").unwrap();
    assert!(drive(&mut target, &mut control, |t, c| c.is_closed()
        && t.session_count() == 0));
}

#[test]
fn console_eof_closes_gracefully() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, keyboard) = connect(&target, &store);
    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));

    drop(keyboard);
    assert!(drive(&mut target, &mut control, |t, c| c.is_closed()
        && t.session_count() == 0));
}

#[test]
fn piped_commands_return_output_before_closing() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);
    let (mut control, mut keyboard) = connect(&target, &store);
    assert!(drive(&mut target, &mut control, |_, c| output(c).contains("Terminal:")));

    keyboard.write_all(b"echo piped-$((1+1))\n").unwrap();
    drop(keyboard);
    assert!(drive(&mut target, &mut control, |t, c| c.is_closed()
        && t.session_count() == 0));
    assert!(output(&control).contains("piped-2"), "output: {:?}", output(&control));
}

#[test]
fn shell_pid_is_read_from_echoed_marker() {
    assert_eq!(parse_pid("echo shell-pid:$$:\r\nshell-pid:4242:\r\n"), Some(4242));
    assert_eq!(parse_pid("echo shell-pid:$$:"), None);
}

#[test]
fn foreign_identity_is_rejected_by_control() {
    init_tracing();
    let store = CredentialStore::embedded().unwrap();
    let mut target = start_target(&store);

    let foreign = rcgen::generate_simple_self_signed(vec!["draupnir".to_string()]).unwrap();
    let other = CredentialStore::from_pem(
        foreign.cert.pem().as_bytes(),
        foreign.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    let (mut control, _keyboard) = connect(&target, &other);

    let mut failed = false;
    for _ in 0..MAX_TURNS {
        target.turn(Some(TICK)).unwrap();
        if control.turn(Some(TICK)).is_err() {
            failed = true;
            break;
        }
    }
    assert!(failed);
    assert!(!control.is_active());
    assert!(drive_target(&mut target, |t| t.session_count() == 0));
}
