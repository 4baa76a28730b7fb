// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The control socket: a unix stream socket in the run directory, speaking
//! one request line and one reply per connection.
//!
//! Requests: `start <unit>`, `stop <unit>`, `reload <unit>`, `status
//! [<unit>]`. Units can be addressed by name or by mount point path.

use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::manager::{Manager, TokenOwner};
use crate::mount::CommandError;
use crate::unit_name;

pub struct ControlConn {
    pub(crate) stream: mio::net::UnixStream,
    buf: Vec<u8>,
}

impl Manager {
    pub(crate) fn accept_control_conns(&mut self) {
        loop {
            match self.control.accept() {
                Ok((mut stream, _)) => {
                    let token = self.alloc_token(TokenOwner::Conn);
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        mio::Interest::READABLE,
                    ) {
                        warn!("failed to register control connection: {}", e);
                        self.token_owners.remove(&token);
                        continue;
                    }

                    debug!("control connection accepted");
                    self.conns.insert(token, ControlConn { stream, buf: Vec::new() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept on control socket: {}", e);
                    break;
                }
            }
        }
    }

    pub(crate) fn control_conn_event(&mut self, token: mio::Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        let mut done = false;
        let mut scratch = [0u8; 1024];
        loop {
            match conn.stream.read(&mut scratch) {
                Ok(0) => {
                    done = true;
                    break;
                }
                Ok(n) => conn.buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    done = true;
                    break;
                }
            }
        }

        if let Some(end) = conn.buf.iter().position(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(&conn.buf[..end]).into_owned();
            let reply = self.handle_control_command(line.trim());

            if let Some(conn) = self.conns.get_mut(&token) {
                let _ = conn.stream.write_all(reply.as_bytes());
            }
            done = true;
        }

        if done {
            if let Some(mut conn) = self.conns.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            self.token_owners.remove(&token);
        }
    }

    pub(crate) fn handle_control_command(&mut self, line: &str) -> String {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let arg = parts.next();

        match (verb, arg) {
            ("status", None) => {
                let mut out = String::new();
                for key in self.units.mounts() {
                    let unit = self.units.unit(key);
                    let m = unit.mount().unwrap();
                    out.push_str(&format!(
                        "{} {} {}\n",
                        unit.name,
                        m.state.as_str(),
                        m.result.as_str()
                    ));
                }
                out
            }
            ("status", Some(name)) => match self.resolve_unit(name) {
                Some(key) => {
                    let unit = self.units.unit(key);
                    match unit.mount() {
                        Some(m) => format!(
                            "{} {} {}\n",
                            unit.name,
                            m.state.as_str(),
                            m.result.as_str()
                        ),
                        None => format!("{} {} -\n", unit.name, unit.active_state().as_str()),
                    }
                }
                None => format!("error no such unit {}\n", name),
            },
            ("start" | "stop" | "reload", Some(name)) => {
                let Some(key) = self.resolve_unit(name) else {
                    return format!("error no such unit {}\n", name);
                };

                let result = match verb {
                    "start" => self.mount_start(key),
                    "stop" => self.mount_stop(key),
                    "reload" => self.mount_reload(key),
                    _ => unreachable!(),
                };

                match result {
                    Ok(()) => "ok\n".to_string(),
                    Err(CommandError::Again) => "again\n".to_string(),
                    Err(e) => format!("error {}\n", e),
                }
            }
            _ => "error unknown command\n".to_string(),
        }
    }

    fn resolve_unit(&self, name: &str) -> Option<crate::units::UnitKey> {
        if name.starts_with('/') {
            let name = unit_name::from_path(Path::new(name)).ok()?;
            return self.units.get(&name);
        }

        self.units.get(name)
    }
}

#[cfg(test)]
mod tests {
    use crate::manager::tests::test_manager;
    use mount_table::MountEntry;

    fn entry(source: &str, target: &str, fstype: &str, options: &str) -> MountEntry {
        MountEntry {
            source: source.to_string(),
            target: target.to_string(),
            fstype: fstype.to_string(),
            options: options.to_string(),
        }
    }

    #[test]
    fn test_status_and_commands() {
        let (mut mgr, _dir) = test_manager();

        mgr.reconcile_entries(&[entry("/dev/sda1", "/srv", "ext4", "rw")], true);

        let status = mgr.handle_control_command("status");
        assert!(status.contains("srv.mount mounted success\n"));

        // Address by path, too.
        let status = mgr.handle_control_command("status /srv");
        assert_eq!(status, "srv.mount mounted success\n");

        assert_eq!(mgr.handle_control_command("stop srv.mount"), "ok\n");
        assert_eq!(mgr.handle_control_command("start srv.mount"), "again\n");

        assert!(mgr
            .handle_control_command("start nope.mount")
            .starts_with("error no such unit"));
        assert!(mgr
            .handle_control_command("frobnicate srv.mount")
            .starts_with("error unknown command"));
    }
}
