//! Interactive shell commands
//!
//! The shell reads stdin from inside the reactor, so commands run on the
//! same thread as every socket callback.

use crate::network::manager::{ConnectionManager, SHELL_TOKEN};
use crate::network::node::Console;
use crate::network::reactor::Reactor;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

/// Larger than stdin's internal buffer, so reads bypass it
const INPUT_CHUNK: usize = 16 * 1024;

/// What the caller should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellOutcome {
    Continue,
    Quit,
}

/// Line-oriented command shell over stdin
#[derive(Debug, Default)]
pub struct Shell {
    pending: String,
}

impl Shell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print the banner and first prompt
    pub fn greet(&self) {
        println!("🌐 relay-node shell. Type 'help' for commands.");
        prompt();
    }

    /// Run one command line
    pub fn execute(
        &mut self,
        line: &str,
        reactor: &mut Reactor,
        manager: &mut ConnectionManager,
    ) -> ShellOutcome {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = words.split_first() else {
            return ShellOutcome::Continue;
        };

        match *command {
            "listen" => cmd_listen(args, reactor, manager),
            "connect" => cmd_connect(args, reactor, manager),
            "connections" => cmd_connections(manager),
            "help" => cmd_help(),
            "quit" => {
                println!("👋 Bye");
                reactor.stop();
                return ShellOutcome::Quit;
            }
            other => println!("❌ Unknown command '{}'. Type 'help'.", other),
        }
        ShellOutcome::Continue
    }
}

impl Console for Shell {
    fn fd(&self) -> RawFd {
        io::stdin().as_raw_fd()
    }

    fn on_input(&mut self, reactor: &mut Reactor, manager: &mut ConnectionManager) {
        let mut chunk = [0u8; INPUT_CHUNK];
        let n = match io::stdin().lock().read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                log::error!("Cannot read stdin: {}", e);
                0
            }
        };
        if n == 0 {
            // End of input behaves like quit
            reactor.deregister(SHELL_TOKEN);
            reactor.stop();
            return;
        }

        self.pending.push_str(&String::from_utf8_lossy(&chunk[..n]));
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            if self.execute(&line, reactor, manager) == ShellOutcome::Quit {
                return;
            }
        }
        prompt();
    }
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = io::stdout().flush();
}

fn parse_endpoint(args: &[&str]) -> Option<SocketAddr> {
    let [ip, port] = args else {
        return None;
    };
    let ip: IpAddr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

fn cmd_listen(args: &[&str], reactor: &mut Reactor, manager: &mut ConnectionManager) {
    if let Some(local) = manager.local_addr() {
        println!("⚠️  Already listening on {}", local);
        return;
    }
    let Some(addr) = parse_endpoint(args) else {
        println!("Usage: listen <ip> <port>");
        return;
    };
    match manager.listen(reactor, addr) {
        Ok(bound) => println!("✅ Listening on {}", bound),
        Err(e) => println!("❌ {}", e),
    }
}

fn cmd_connect(args: &[&str], reactor: &mut Reactor, manager: &mut ConnectionManager) {
    if !manager.is_listening() {
        println!("⚠️  Run 'listen <ip> <port>' before connecting");
        return;
    }
    let Some(addr) = parse_endpoint(args) else {
        println!("Usage: connect <ip> <port>");
        return;
    };
    if manager.open(reactor, addr) {
        println!("🔗 Connecting to {}...", addr);
    } else {
        println!("⚠️  Not connecting to {} (duplicate, own address, or peer limit)", addr);
    }
}

fn cmd_connections(manager: &ConnectionManager) {
    let open = manager.open_peers();
    let half_open = manager.half_open_peers();
    if open.is_empty() && half_open.is_empty() {
        println!("📭 No connections");
        return;
    }

    println!("📋 Open ({}):", open.len());
    for conn in open {
        let direction = if conn.is_outbound() { "out" } else { "in" };
        println!("   {} [{}] {:?}", conn.addr(), direction, conn.handshake_state());
    }
    println!("⏳ Half-open ({}):", half_open.len());
    for conn in half_open {
        println!("   {}", conn.addr());
    }
}

fn cmd_help() {
    println!("Commands:");
    println!("   listen <ip> <port>    Accept peers on this address (once)");
    println!("   connect <ip> <port>   Connect to a peer (after listen)");
    println!("   connections           List open and pending connections");
    println!("   help                  Show this help");
    println!("   quit                  Exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::network::node::NodeConfig;
    use crate::network::reactor::testing::scripted_reactor;
    use std::net::TcpListener;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(&NodeConfig::default(), Box::new(MemoryChain::new()))
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint(&["127.0.0.1", "8333"]),
            Some("127.0.0.1:8333".parse().unwrap())
        );
        assert_eq!(parse_endpoint(&["127.0.0.1"]), None);
        assert_eq!(parse_endpoint(&["localhost", "8333"]), None);
        assert_eq!(parse_endpoint(&["127.0.0.1", "99999"]), None);
    }

    #[test]
    fn test_connect_needs_listen() {
        let (mut reactor, _poller, _clock) = scripted_reactor();
        let mut mgr = manager();
        let mut shell = Shell::new();
        let target = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port().to_string();

        shell.execute(&format!("connect 127.0.0.1 {}", port), &mut reactor, &mut mgr);
        assert_eq!(mgr.peer_count(), 0);

        shell.execute("listen 127.0.0.1 0", &mut reactor, &mut mgr);
        assert!(mgr.is_listening());
        shell.execute(&format!("connect 127.0.0.1 {}", port), &mut reactor, &mut mgr);
        assert_eq!(mgr.half_open_peers().len(), 1);
    }

    #[test]
    fn test_listen_once() {
        let (mut reactor, _poller, _clock) = scripted_reactor();
        let mut mgr = manager();
        let mut shell = Shell::new();

        shell.execute("listen 127.0.0.1 0", &mut reactor, &mut mgr);
        let first = mgr.local_addr();
        shell.execute("listen 127.0.0.1 0", &mut reactor, &mut mgr);
        assert_eq!(mgr.local_addr(), first);
    }

    #[test]
    fn test_quit_stops_reactor() {
        let (mut reactor, _poller, _clock) = scripted_reactor();
        let mut mgr = manager();
        let mut shell = Shell::new();

        assert_eq!(shell.execute("", &mut reactor, &mut mgr), ShellOutcome::Continue);
        assert_eq!(shell.execute("help", &mut reactor, &mut mgr), ShellOutcome::Continue);
        assert_eq!(shell.execute("bogus", &mut reactor, &mut mgr), ShellOutcome::Continue);
        assert_eq!(shell.execute("quit", &mut reactor, &mut mgr), ShellOutcome::Quit);
        assert!(!reactor.is_running());
    }
}
