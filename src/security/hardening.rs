//! Container hardening profiles.
//!
//! A profile bundles the resource caps, capability set, ulimits, user, and
//! syscall filter applied at container create, parameterized by a named
//! security level. The seccomp document is rendered to JSON and handed to
//! the engine through `security_opt`.

use serde::Serialize;

/// Named bundle of hardening values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Read-only rootfs, tmpfs workspace, tightest caps
    Strict,
    /// Default: capability re-adds needed for package installs
    Standard,
    /// Engine-default seccomp, larger caps; for trusted workloads
    Permissive,
}

/// One ulimit entry.
#[derive(Debug, Clone)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    fn new(name: &str, soft: i64, hard: i64) -> Self {
        Self {
            name: name.to_string(),
            soft,
            hard,
        }
    }
}

/// Hardening values consumed at container create.
#[derive(Debug, Clone)]
pub struct HardeningProfile {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub readonly_rootfs: bool,
    /// (mount point, mount options) pairs backed by tmpfs
    pub tmpfs_mounts: Vec<(String, String)>,
    pub ulimits: Vec<Ulimit>,
    pub user: String,
    seccomp: Option<SeccompProfile>,
}

impl HardeningProfile {
    /// Build the profile for a security level with no language extras.
    pub fn for_level(level: SecurityLevel) -> Self {
        Self::for_level_with_syscalls(level, &[])
    }

    /// Build the profile for a security level, allowing additional
    /// language-specific syscalls (e.g. SysV IPC for interpreters that use
    /// shared memory).
    pub fn for_level_with_syscalls(level: SecurityLevel, extra_syscalls: &[&str]) -> Self {
        let seccomp = match level {
            // Permissive keeps the engine's default profile
            SecurityLevel::Permissive => None,
            _ => Some(SeccompProfile::with_extras(extra_syscalls)),
        };

        match level {
            SecurityLevel::Strict => Self {
                memory_bytes: 256 * 1024 * 1024,
                cpu_quota: 25_000,
                pids_limit: 64,
                cap_drop: vec!["ALL".to_string()],
                cap_add: Vec::new(),
                readonly_rootfs: true,
                tmpfs_mounts: vec![
                    (
                        "/workspace".to_string(),
                        "rw,exec,nosuid,size=268435456".to_string(),
                    ),
                    ("/tmp".to_string(), "rw,noexec,nosuid,size=67108864".to_string()),
                ],
                ulimits: vec![
                    Ulimit::new("nofile", 256, 256),
                    Ulimit::new("nproc", 64, 64),
                    Ulimit::new("core", 0, 0),
                ],
                user: "1000:1000".to_string(),
                seccomp,
            },
            SecurityLevel::Standard => Self {
                memory_bytes: 512 * 1024 * 1024,
                cpu_quota: 50_000,
                pids_limit: 128,
                cap_drop: vec!["ALL".to_string()],
                // Package managers need to chown and drop privileges
                cap_add: vec![
                    "CHOWN".to_string(),
                    "SETUID".to_string(),
                    "SETGID".to_string(),
                ],
                readonly_rootfs: false,
                tmpfs_mounts: Vec::new(),
                ulimits: vec![
                    Ulimit::new("nofile", 1024, 1024),
                    Ulimit::new("nproc", 128, 128),
                    Ulimit::new("core", 0, 0),
                ],
                user: "1000:1000".to_string(),
                seccomp,
            },
            SecurityLevel::Permissive => Self {
                memory_bytes: 1024 * 1024 * 1024,
                cpu_quota: 100_000,
                pids_limit: 256,
                cap_drop: vec!["ALL".to_string()],
                cap_add: vec![
                    "CHOWN".to_string(),
                    "SETUID".to_string(),
                    "SETGID".to_string(),
                ],
                readonly_rootfs: false,
                tmpfs_mounts: Vec::new(),
                ulimits: vec![
                    Ulimit::new("nofile", 4096, 4096),
                    Ulimit::new("nproc", 256, 256),
                    Ulimit::new("core", 0, 0),
                ],
                user: "1000:1000".to_string(),
                seccomp,
            },
        }
    }

    /// Render the `security_opt` entries for container create.
    pub fn security_opts(&self) -> Vec<String> {
        let mut opts = vec!["no-new-privileges:true".to_string()];
        if let Some(ref seccomp) = self.seccomp {
            opts.push(format!("seccomp={}", seccomp.to_json()));
        }
        opts
    }
}

/// Syscalls every sandboxed workload needs: file and memory management,
/// process basics, polling, and time.
const BASE_ALLOWED_SYSCALLS: &[&str] = &[
    "read", "write", "open", "openat", "openat2", "close", "stat", "fstat", "lstat", "newfstatat",
    "statx", "poll", "ppoll", "lseek", "mmap", "mprotect", "munmap", "mremap", "brk", "madvise",
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigtimedwait", "sigaltstack", "ioctl",
    "pread64", "pwrite64", "readv", "writev", "access", "faccessat", "faccessat2", "pipe",
    "pipe2", "select", "pselect6", "sched_yield", "sched_getaffinity", "msync", "mincore", "dup",
    "dup2", "dup3", "nanosleep", "clock_nanosleep", "clock_gettime", "clock_getres",
    "gettimeofday", "getpid", "getppid", "gettid", "tgkill", "clone", "clone3", "fork", "vfork",
    "execve", "execveat", "exit", "exit_group", "wait4", "waitid", "uname", "fcntl", "flock",
    "fsync", "fdatasync", "truncate", "ftruncate", "getdents64", "getcwd", "chdir", "fchdir",
    "rename", "renameat", "renameat2", "mkdir", "mkdirat", "rmdir", "creat", "link", "linkat",
    "unlink", "unlinkat", "symlink", "symlinkat", "readlink", "readlinkat", "chmod", "fchmod",
    "fchmodat", "fchown", "fchownat", "umask", "getrlimit", "prlimit64", "getrusage", "sysinfo",
    "times", "getuid", "getgid", "geteuid", "getegid", "getgroups", "getpgrp", "getpgid",
    "setpgid", "getsid", "setsid", "futex", "futex_waitv", "epoll_create1", "epoll_ctl",
    "epoll_wait", "epoll_pwait", "eventfd2", "socketpair", "arch_prctl", "prctl",
    "set_tid_address", "set_robust_list", "get_robust_list", "getrandom", "memfd_create",
    "sendfile", "copy_file_range", "fadvise64", "utimensat", "rseq", "membarrier",
];

/// Syscalls killed outright: namespace and mount manipulation, tracing,
/// module loading, kexec, reboot, BPF, perf, key management, userfaultfd,
/// and filesystem-handle escapes.
const BLOCKED_SYSCALLS: &[&str] = &[
    "unshare", "setns", "mount", "move_mount", "umount2", "open_tree", "fsopen", "fsconfig",
    "fsmount", "fspick", "pivot_root", "chroot", "ptrace", "process_vm_readv",
    "process_vm_writev", "init_module", "finit_module", "delete_module", "kexec_load",
    "kexec_file_load", "reboot", "bpf", "perf_event_open", "keyctl", "add_key", "request_key",
    "userfaultfd", "open_by_handle_at", "name_to_handle_at", "quotactl", "swapon", "swapoff",
    "acct", "settimeofday", "clock_settime",
];

/// SysV IPC syscalls, the common per-language extra.
pub const SYSV_IPC_SYSCALLS: &[&str] = &[
    "shmget", "shmat", "shmdt", "shmctl", "semget", "semop", "semtimedop", "semctl", "msgget",
    "msgsnd", "msgrcv", "msgctl",
];

/// Seccomp profile document in the engine's JSON schema.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SeccompProfile {
    default_action: &'static str,
    architectures: Vec<&'static str>,
    syscalls: Vec<SyscallRule>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyscallRule {
    names: Vec<String>,
    action: &'static str,
}

impl SeccompProfile {
    fn with_extras(extra_syscalls: &[&str]) -> Self {
        let mut allowed: Vec<String> = BASE_ALLOWED_SYSCALLS
            .iter()
            .map(|s| s.to_string())
            .collect();
        allowed.extend(extra_syscalls.iter().map(|s| s.to_string()));
        allowed.sort_unstable();
        allowed.dedup();

        Self {
            default_action: "SCMP_ACT_ERRNO",
            architectures: vec!["SCMP_ARCH_X86_64", "SCMP_ARCH_AARCH64"],
            syscalls: vec![
                SyscallRule {
                    names: allowed,
                    action: "SCMP_ACT_ALLOW",
                },
                SyscallRule {
                    names: BLOCKED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
                    action: "SCMP_ACT_KILL_PROCESS",
                },
            ],
        }
    }

    fn to_json(&self) -> String {
        // The document is built from static data; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_profile_shape() {
        let profile = HardeningProfile::for_level(SecurityLevel::Strict);
        assert!(profile.readonly_rootfs);
        assert!(profile.cap_add.is_empty());
        assert_eq!(profile.cap_drop, vec!["ALL"]);
        assert_eq!(profile.user, "1000:1000");
        assert!(
            profile
                .tmpfs_mounts
                .iter()
                .any(|(path, opts)| path == "/workspace" && opts.contains("exec"))
        );
        assert!(
            profile
                .tmpfs_mounts
                .iter()
                .any(|(path, opts)| path == "/tmp" && opts.contains("noexec"))
        );
        assert!(
            profile
                .ulimits
                .iter()
                .any(|u| u.name == "core" && u.hard == 0)
        );
    }

    #[test]
    fn test_standard_readds_install_caps() {
        let profile = HardeningProfile::for_level(SecurityLevel::Standard);
        assert!(!profile.readonly_rootfs);
        for cap in ["CHOWN", "SETUID", "SETGID"] {
            assert!(profile.cap_add.iter().any(|c| c == cap));
        }
    }

    #[test]
    fn test_seccomp_present_except_permissive() {
        let opts = HardeningProfile::for_level(SecurityLevel::Strict).security_opts();
        assert!(opts.iter().any(|o| o.starts_with("seccomp=")));

        let opts = HardeningProfile::for_level(SecurityLevel::Permissive).security_opts();
        assert!(!opts.iter().any(|o| o.starts_with("seccomp=")));
        assert!(opts.iter().any(|o| o == "no-new-privileges:true"));
    }

    #[test]
    fn test_seccomp_document_blocks_escape_syscalls() {
        let opts = HardeningProfile::for_level(SecurityLevel::Standard).security_opts();
        let seccomp = opts
            .iter()
            .find(|o| o.starts_with("seccomp="))
            .unwrap()
            .trim_start_matches("seccomp=")
            .to_string();

        let doc: serde_json::Value = serde_json::from_str(&seccomp).unwrap();
        assert_eq!(doc["defaultAction"], "SCMP_ACT_ERRNO");

        let rules = doc["syscalls"].as_array().unwrap();
        let kill_rule = rules
            .iter()
            .find(|r| r["action"] == "SCMP_ACT_KILL_PROCESS")
            .unwrap();
        let killed: Vec<&str> = kill_rule["names"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        for syscall in ["unshare", "mount", "ptrace", "bpf", "kexec_load", "userfaultfd"] {
            assert!(killed.contains(&syscall), "{syscall} must be killed");
        }
    }

    #[test]
    fn test_language_extras_merged() {
        let profile =
            HardeningProfile::for_level_with_syscalls(SecurityLevel::Standard, SYSV_IPC_SYSCALLS);
        let opts = profile.security_opts();
        let seccomp = opts.iter().find(|o| o.starts_with("seccomp=")).unwrap();
        assert!(seccomp.contains("shmget"));
        assert!(seccomp.contains("semop"));
    }
}
