//! Desktop session owner discovery
//!
//! The controller runs as root, but per-user surfaces (KDE, npm) belong to
//! whoever owns the graphical session. That user is found from the
//! session processes in the host's process table and resolved through
//! `/etc/passwd`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Process names that mark a running KDE session
const KDE_PROCESSES: &[&str] = &["plasmashell", "ksmserver", "kwin_x11", "kwin_wayland"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    /// Home directory as an absolute host path
    pub home: PathBuf,
}

/// A running process, as much of it as session discovery needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    /// Real uid of the owner, when known
    pub uid: Option<u32>,
}

/// Source of the host's process list
pub trait ProcessTable: fmt::Debug + Send + Sync {
    fn processes(&self) -> Vec<ProcessInfo>;
}

/// The live process table
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl ProcessTable for SystemProcesses {
    fn processes(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_user(UpdateKind::OnlyIfNotSet),
        );

        system
            .processes()
            .values()
            .map(|process| ProcessInfo {
                name: process.name().to_string_lossy().into_owned(),
                uid: process.user_id().and_then(uid_value),
            })
            .collect()
    }
}

#[cfg(unix)]
fn uid_value(uid: &sysinfo::Uid) -> Option<u32> {
    Some(**uid)
}

#[cfg(not(unix))]
fn uid_value(_uid: &sysinfo::Uid) -> Option<u32> {
    None
}

/// Whether `name` names a KDE session process
fn is_kde_process(name: &str) -> bool {
    KDE_PROCESSES.contains(&name) || name.starts_with("kwin_")
}

/// Uid owning a KDE session process, if one is running
pub fn kde_session_uid(processes: &[ProcessInfo]) -> Option<u32> {
    processes
        .iter()
        .filter(|p| is_kde_process(&p.name))
        .find_map(|p| match p.uid {
            Some(0) | None => None,
            Some(uid) => {
                log::debug!("KDE session process {} owned by uid {uid}", p.name);
                Some(uid)
            }
        })
}

fn parse_passwd_line(line: &str) -> Option<DesktopUser> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(DesktopUser {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: PathBuf::from(fields[5]),
    })
}

/// Look up a passwd entry matching `pred`
fn lookup(root: &Path, pred: impl Fn(&DesktopUser) -> bool) -> Option<DesktopUser> {
    let passwd = fs::read_to_string(root.join("etc/passwd")).ok()?;
    passwd
        .lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(parse_passwd_line)
        .find(|user| pred(user))
}

pub fn lookup_by_uid(root: &Path, uid: u32) -> Option<DesktopUser> {
    lookup(root, |user| user.uid == uid)
}

pub fn lookup_by_name(root: &Path, name: &str) -> Option<DesktopUser> {
    lookup(root, |user| user.name == name)
}

/// The desktop user: the configured name when given, otherwise the owner
/// of the running KDE session.
pub fn discover(root: &Path, processes: &[ProcessInfo], configured: Option<&str>) -> Option<DesktopUser> {
    let user = match configured {
        Some(name) => lookup_by_name(root, name),
        None => kde_session_uid(processes).and_then(|uid| lookup_by_uid(root, uid)),
    };

    match &user {
        Some(user) => log::info!("Desktop user: {} (uid {})", user.name, user.uid),
        None => log::debug!("No desktop user found"),
    }
    user
}

/// Hand a file the session created over to `user`
#[cfg(unix)]
pub fn chown_to(path: &Path, user: &DesktopUser) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(user.uid), Some(user.gid))
}

#[cfg(not(unix))]
pub fn chown_to(_path: &Path, _user: &DesktopUser) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::{ProcessInfo, ProcessTable};
    use std::fs;
    use std::path::Path;

    pub const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                              alice:x:1000:1000:Alice:/home/alice:/bin/bash\n\
                              bob:x:1001:1001::/home/bob:/bin/zsh\n";

    pub fn write_passwd(root: &Path) {
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/passwd"), PASSWD).unwrap();
    }

    pub fn process(name: &str, uid: u32) -> ProcessInfo {
        ProcessInfo {
            name: name.to_string(),
            uid: Some(uid),
        }
    }

    /// A fixed process table
    #[derive(Debug, Default)]
    pub struct ProcessList(pub Vec<ProcessInfo>);

    impl ProcessTable for ProcessList {
        fn processes(&self) -> Vec<ProcessInfo> {
            self.0.clone()
        }
    }
}
