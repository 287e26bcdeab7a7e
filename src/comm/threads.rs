//! Потоковый SPMD-коммуникатор: n рангов в одном процессе, по потоку на ранг.
//!
//! Каждый ранг владеет inbox'ом (Mutex<VecDeque> + Condvar); send кладёт
//! сообщение в чужой inbox и будит ожидающих — то есть никогда не блокируется,
//! как того требует контракт Communicator. recv матчит по (from, tag) с FIFO
//! внутри пары отправитель/тег.
//!
//! Предназначен для тестов коллективных операций движка; запускалка реальных
//! процессов — вне библиотеки.

use std::collections::VecDeque;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use super::Communicator;

/// Сколько ждать недоставленное сообщение, прежде чем счесть ранг погибшим.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

struct Message {
    from: usize,
    tag: u32,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    ready: Condvar,
}

struct Shared {
    inboxes: Vec<Inbox>,
    barrier: Barrier,
}

pub struct ThreadComm {
    me: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Создать коммуникаторы для n рангов; каждый отдать своему потоку.
    pub fn create(n: usize) -> Vec<ThreadComm> {
        assert!(n > 0, "communicator needs at least one rank");
        let shared = Arc::new(Shared {
            inboxes: (0..n).map(|_| Inbox::default()).collect(),
            barrier: Barrier::new(n),
        });
        (0..n)
            .map(|me| ThreadComm {
                me,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn take_matching<F>(&self, mut pred: F) -> Result<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let inbox = &self.shared.inboxes[self.me];
        let mut queue = inbox
            .queue
            .lock()
            .map_err(|_| anyhow::anyhow!("communicator inbox poisoned (a rank panicked)"))?;
        loop {
            if let Some(pos) = queue.iter().position(&mut pred) {
                // remove(pos) сохраняет FIFO оставшихся
                return Ok(queue.remove(pos).unwrap());
            }
            let (guard, timeout) = inbox
                .ready
                .wait_timeout(queue, RECV_TIMEOUT)
                .map_err(|_| anyhow::anyhow!("communicator inbox poisoned (a rank panicked)"))?;
            queue = guard;
            if timeout.timed_out() {
                bail!("recv timed out after {:?} on rank {}", RECV_TIMEOUT, self.me);
            }
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.me
    }

    fn size(&self) -> usize {
        self.shared.inboxes.len()
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn send(&self, to: usize, tag: u32, bytes: &[u8]) -> Result<()> {
        if to >= self.size() {
            bail!("send to rank {} outside communicator of size {}", to, self.size());
        }
        let inbox = &self.shared.inboxes[to];
        let mut queue = inbox
            .queue
            .lock()
            .map_err(|_| anyhow::anyhow!("communicator inbox poisoned (a rank panicked)"))?;
        queue.push_back(Message {
            from: self.me,
            tag,
            bytes: bytes.to_vec(),
        });
        inbox.ready.notify_all();
        Ok(())
    }

    fn recv(&self, from: usize, tag: u32) -> Result<Vec<u8>> {
        let msg = self.take_matching(|m| m.from == from && m.tag == tag)?;
        Ok(msg.bytes)
    }

    fn recv_any(&self, tag: u32) -> Result<(usize, Vec<u8>)> {
        let msg = self.take_matching(|m| m.tag == tag)?;
        Ok((msg.from, msg.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ReduceOp;

    #[test]
    fn p2p_and_collectives() {
        let comms = ThreadComm::create(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                std::thread::spawn(move || -> Result<()> {
                    let me = c.rank() as u64;

                    // кольцо: каждый шлёт следующему свой ранг
                    let next = (c.rank() + 1) % c.size();
                    let prev = (c.rank() + c.size() - 1) % c.size();
                    c.send(next, 7, &me.to_le_bytes())?;
                    let got = c.recv(prev, 7)?;
                    assert_eq!(u64::from_le_bytes(got.try_into().unwrap()), prev as u64);

                    assert_eq!(c.allreduce_u64(me, ReduceOp::Sum)?, 6);
                    assert_eq!(c.allreduce_u64(me, ReduceOp::Max)?, 3);
                    assert_eq!(c.allreduce_u64(10 + me, ReduceOp::Min)?, 10);

                    let mut buf = if c.rank() == 2 { b"hello".to_vec() } else { Vec::new() };
                    c.broadcast(2, &mut buf)?;
                    assert_eq!(buf, b"hello");

                    let mut bins = vec![me, 1];
                    c.allreduce_sum_u64_slice(&mut bins)?;
                    assert_eq!(bins, vec![6, 4]);

                    c.barrier();
                    Ok(())
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
    }
}
