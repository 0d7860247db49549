//! Decision collaborators running as contained child processes.
//!
//! The arena binds a loopback listener, launches the agent executable with the port as its
//! first argument, and waits for it to connect. Each turn is one exchange of
//! newline-delimited messages:
//!
//! - request: `{"request": <n>, "timeout_ms": <ms>, "observation": {...}}`
//! - reply: `{"request": <n>, "decision": ...}` on one line, echoing the request number.
//!   The decision is either the decision object or the raw decision text as a JSON string.
//!
//! Lines that are not a reply to the pending request are skipped until its deadline, and
//! bytes left over from an earlier request are drained before the next one is sent, so a
//! slow agent can never answer the wrong turn.

use std::{
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    cgroup_manager::{self, ChildOutput, Containment, LimitedProcess, ProcessLimits},
    decision::{DecisionMaker, Observation},
    side::Contestant,
};

#[derive(Serialize)]
struct Request<'a> {
    request: u64,
    timeout_ms: u64,
    observation: &'a Observation,
}

#[derive(Deserialize)]
struct Reply {
    request: u64,
    decision: serde_json::Value,
}

/// Line-oriented request/response channel to one agent.
#[derive(Debug)]
pub struct AgentConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl AgentConnection {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream
            .set_nodelay(true)
            .context("server error: setting nodelay")?;
        let writer = stream
            .try_clone()
            .context("server error: cloning agent stream")?;
        Ok(AgentConnection {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Send request `id` as one line and wait up to `max_duration` for the reply that
    /// echoes `id`. Replies to other requests are skipped.
    #[instrument(skip_all, fields(request = id))]
    pub fn exchange(
        &mut self,
        id: u64,
        line: &str,
        max_duration: Duration,
    ) -> anyhow::Result<String> {
        let deadline = Instant::now() + max_duration;
        self.discard_stale()?;

        let mut message = line.trim_end().as_bytes().to_vec();
        message.push(b'\n');
        self.writer
            .write_all(&message)
            .context("I/O error while sending request")?;
        self.writer.flush().context("I/O error while sending request")?;

        loop {
            let line = self.read_line(deadline, max_duration)?;
            let reply = match serde_json::from_slice::<Reply>(&line) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(bytes = line.len(), "skipping malformed agent line: {e}");
                    continue;
                }
            };
            if reply.request != id {
                debug!(got = reply.request, "skipping reply to another request");
                continue;
            }
            return Ok(match reply.decision {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            });
        }
    }

    /// One complete line, read before `deadline`.
    fn read_line(
        &mut self,
        deadline: Instant,
        max_duration: Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("agent did not answer within {:.3}s", max_duration.as_secs_f64());
            }
            self.reader
                .get_ref()
                .set_read_timeout(Some(remaining))
                .context("server error: setting read timeout")?;
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => bail!("connection closed by agent"),
                Ok(_) if line.ends_with(b"\n") => return Ok(line),
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    bail!("agent did not answer within {:.3}s", max_duration.as_secs_f64())
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("error while reading stream"),
            }
        }
    }

    /// Drop whatever the agent sent after a previous deadline.
    fn discard_stale(&mut self) -> anyhow::Result<()> {
        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            debug!(bytes = buffered, "discarding late answer");
            self.reader.consume(buffered);
        }
        let stream = self.reader.get_mut();
        stream
            .set_nonblocking(true)
            .context("server error: setting non-blocking")?;
        let mut scratch = [0u8; 4096];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Err(anyhow!("connection closed by agent")),
                Ok(n) => debug!(bytes = n, "discarding late answer"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e).context("error while reading stream"),
            }
        };
        stream
            .set_nonblocking(false)
            .context("server error: setting blocking")?;
        drained
    }
}

/// An agent executable launched for one side of one game.
///
/// The child (and its cgroup) is killed on drop.
#[derive(Debug)]
pub struct ProcessAgent {
    connection: AgentConnection,
    process: LimitedProcess,
    requests: u64,
}

impl ProcessAgent {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Launch `contestant`'s agent executable under `limits` and wait for it to connect.
    ///
    /// The executable receives `<port> --side <side> --model <model>` followed by the
    /// contestant's own arguments.
    #[instrument(skip_all, fields(side = %contestant.side, model = %contestant.model))]
    pub fn launch(
        contestant: &Contestant,
        limits: &ProcessLimits,
        containment: Containment,
        debug_stderr: bool,
    ) -> anyhow::Result<ProcessAgent> {
        let path = contestant
            .agent_exe
            .as_ref()
            .context("no path to agent executable")?
            .clone()
            .into_os_string()
            .into_string()
            .map_err(|_| anyhow!("agent path is not a valid string"))?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .context("server error: could not create TcpListener")?;
        let port = listener.local_addr()?.port();

        let mut args = vec![
            port.to_string(),
            "--side".to_string(),
            contestant.side.to_string(),
            "--model".to_string(),
            contestant.model.clone(),
        ];
        args.extend(contestant.agent_args.iter().cloned());

        let stderr = if debug_stderr {
            ChildOutput::Inherit
        } else {
            ChildOutput::Discard
        };
        let mut process =
            cgroup_manager::launch(&path, &args, limits, ChildOutput::Discard, stderr, containment)
                .context("server error: agent process creation failed")?;

        listener
            .set_nonblocking(true)
            .context("server error: setting non-blocking to true")?;

        let connect_deadline = Instant::now() + Self::CONNECT_TIMEOUT;
        while Instant::now() < connect_deadline {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream
                        .set_nonblocking(false)
                        .context("server error: setting blocking")?;
                    debug!(port, "agent connected");
                    return Ok(ProcessAgent {
                        connection: AgentConnection::new(stream)?,
                        process,
                        requests: 0,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
            if let Ok(Some(status)) = process.child.try_wait() {
                bail!("agent exited before connecting ({status})");
            }
            thread::sleep(Duration::from_millis(10));
        }

        if let Err(e) = process.try_kill(Duration::from_secs(1)) {
            warn!("could not kill agent that never connected: {e:#}");
        }
        Err(anyhow!(
            "agent did not connect within {}s",
            Self::CONNECT_TIMEOUT.as_secs()
        ))
    }
}

impl DecisionMaker for ProcessAgent {
    fn decide(&mut self, observation: &Observation, timeout: Duration) -> anyhow::Result<String> {
        self.requests += 1;
        let request = serde_json::to_string(&Request {
            request: self.requests,
            timeout_ms: timeout.as_millis() as u64,
            observation,
        })?;
        self.connection.exchange(self.requests, &request, timeout)
    }
}

impl Drop for ProcessAgent {
    fn drop(&mut self) {
        if let Err(e) = self.process.try_kill(Duration::from_secs(1)) {
            warn!("could not kill agent process: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side::Side;

    fn pair() -> (AgentConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let agent = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (AgentConnection::new(server).unwrap(), agent)
    }

    fn answer_each_line(agent: TcpStream, reply: impl Fn(&str) -> Option<String> + Send + 'static) {
        thread::spawn(move || {
            let mut writer = agent.try_clone().unwrap();
            for line in BufReader::new(agent).lines() {
                let Ok(line) = line else { break };
                if let Some(answer) = reply(&line) {
                    writer.write_all(answer.as_bytes()).unwrap();
                }
            }
        });
    }

    fn request(id: u64, tag: &str) -> String {
        serde_json::json!({"request": id, "tag": tag}).to_string()
    }

    /// The reply line an agent sends back for `line`.
    fn reply(line: &str, decision: serde_json::Value) -> String {
        let request: serde_json::Value = serde_json::from_str(line).unwrap();
        serde_json::json!({"request": request["request"], "decision": decision}).to_string() + "\n"
    }

    #[test]
    fn exchange_returns_the_decision_of_the_matching_reply() {
        let (mut connection, agent) = pair();
        answer_each_line(agent, |line| {
            Some(reply(line, serde_json::json!({"command": "id"})))
        });
        let answer = connection
            .exchange(1, &request(1, "first"), Duration::from_secs(5))
            .unwrap();
        let decision: serde_json::Value = serde_json::from_str(&answer).unwrap();
        assert_eq!(decision["command"], "id");
    }

    #[test]
    fn text_decisions_keep_their_line_breaks() {
        let (mut connection, agent) = pair();
        answer_each_line(agent, |line| {
            Some(reply(line, "```json\n{\"command\": \"id\"}\n```".into()))
        });
        let answer = connection
            .exchange(1, &request(1, "first"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(answer, "```json\n{\"command\": \"id\"}\n```");
    }

    #[test]
    fn lines_for_other_requests_are_skipped() {
        let (mut connection, agent) = pair();
        answer_each_line(agent, |line| {
            let stray = serde_json::json!({"request": 41, "decision": "old"}).to_string();
            Some(format!("not json\n{stray}\n{}", reply(line, "current".into())))
        });
        let answer = connection
            .exchange(42, &request(42, "now"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(answer, "current");
    }

    #[test]
    fn silent_agents_time_out_and_late_answers_are_discarded() {
        let (mut connection, agent) = pair();
        answer_each_line(agent, |line| {
            if line.contains("slow") {
                thread::sleep(Duration::from_millis(300));
                Some(reply(line, "late".into()))
            } else {
                Some(reply(line, "fresh".into()))
            }
        });
        let started = Instant::now();
        let error = connection
            .exchange(1, &request(1, "slow"), Duration::from_millis(100))
            .unwrap_err();
        assert!(error.to_string().contains("did not answer"));
        assert!(started.elapsed() < Duration::from_millis(280));

        thread::sleep(Duration::from_millis(400));
        let answer = connection
            .exchange(2, &request(2, "fast"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(answer, "fresh");
    }

    #[test]
    fn an_answer_landing_after_the_drain_is_not_taken_for_the_next_turn() {
        let (mut connection, agent) = pair();
        answer_each_line(agent, |line| {
            if line.contains("slow") {
                thread::sleep(Duration::from_millis(150));
                Some(reply(line, "slow".into()))
            } else {
                Some(reply(line, "fresh".into()))
            }
        });
        assert!(connection
            .exchange(1, &request(1, "slow"), Duration::from_millis(100))
            .is_err());
        // issued at once: the late reply to request 1 arrives while request 2 is pending
        let answer = connection
            .exchange(2, &request(2, "fast"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(answer, "fresh");
    }

    #[test]
    fn closed_connections_are_errors() {
        let (mut connection, agent) = pair();
        drop(agent);
        assert!(connection
            .exchange(1, &request(1, "first"), Duration::from_secs(1))
            .is_err());
    }

    #[test]
    fn launching_without_an_executable_fails() {
        let contestant = Contestant::new(Side::Red, "model", "red-kali");
        let result = ProcessAgent::launch(
            &contestant,
            &ProcessLimits::default(),
            Containment::Disabled,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn agents_that_exit_early_are_reported() {
        let contestant = Contestant::new(Side::Blue, "model", "blue-target")
            .with_agent_exe("true", vec![]);
        let error = ProcessAgent::launch(
            &contestant,
            &ProcessLimits::default(),
            Containment::Disabled,
            false,
        )
        .unwrap_err();
        assert!(error.to_string().contains("exited before connecting"));
    }
}
