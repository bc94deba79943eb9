//! The capture engine.
//!
//! [`Engine`] owns the process-wide registries (device map, group table,
//! socket table) and one pipeline context per CPU. The receive hook pushes
//! packets into the caller CPU's batch arena and runs the batch processor
//! inline once `prefetch_len` packets have accumulated; a flush timer
//! bounds the latency of residual packets.
//!
//! ## Batch processing
//!
//! One batch runs in four phases, entirely on the calling CPU:
//!
//! 1. every buffer's group mask is read from the device map and its
//!    sequence counter assigned;
//! 2. groups are visited in ascending id order: the group's filter, VLAN
//!    set and classifier are snapshotted once, every member packet is
//!    evaluated, the weighted steering choice is memoized per CPU, and the
//!    selected payloads are enqueued into each socket queue in arrival
//!    order;
//! 3. lazy egress endpoints recorded by classifiers are transmitted;
//! 4. packets flagged for the kernel are re-injected and every buffer
//!    returns to the CPU's pool.
//!
//! Shared state is snapshotted under an epoch pin held for the duration of
//! the batch; control-plane writers swap pointers and defer reclamation, so
//! the hot path never takes a lock.

use std::sync::atomic::{ AtomicBool, AtomicI32, Ordering };
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{ Instant, SystemTime, UNIX_EPOCH };

use crossbeam::epoch;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

use crate::bits::{ fold, prefold, set_bits };
use crate::config::EngineConfig;
use crate::constants::{ BATCH_LEN, CLASS_MASK_ALL, MAX_GROUPS, MAX_SOCKETS, MAX_SOCK_MASK };
use crate::devmap::{ DevMap, MapUpdate };
use crate::error::{ Result, SteerError };
use crate::group::{ GroupPolicy, GroupTable };
use crate::lang::{ self, Computation, Disposition, Monad, Verdict };
use crate::bpf::BpfProgram;
use crate::percpu::CpuContext;
use crate::pool::BatchArena;
use crate::qbuff::{ PacketDirection, Qbuff, RawPacket };
use crate::socket::SockTable;
use crate::sock_queue::CapturedSlot;
use crate::stats::{ GlobalCounters, GlobalStats, GroupStats, SockStats };

/// Transmit hook for lazy egress devices.
pub trait EgressHook: Send + Sync {
    /// Transmit `packet` towards `ifindex`. Returns false when the packet
    /// could not be sent.
    fn xmit(&self, packet: &RawPacket, ifindex: u32) -> bool;
}

/// Hand-off hook for kernel re-injection.
pub trait KernelHook: Send + Sync {
    fn inject(&self, packet: &RawPacket);
}

/// Default egress: accept and discard.
pub struct SinkEgress;

impl EgressHook for SinkEgress {
    fn xmit(&self, _packet: &RawPacket, _ifindex: u32) -> bool {
        true
    }
}

/// Default kernel hook: drop the packet.
pub struct NullKernel;

impl KernelHook for NullKernel {
    fn inject(&self, _packet: &RawPacket) {}
}

#[inline]
fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

pub struct Engine {
    config: EngineConfig,
    devmap: DevMap,
    groups: GroupTable,
    socks: SockTable,
    cpu: Vec<CachePadded<Mutex<CpuContext>>>,
    tstamp_toggle: AtomicI32,
    stats: GlobalCounters,
    egress: Box<dyn EgressHook>,
    kernel: Box<dyn KernelHook>,
    timer_stop: Arc<AtomicBool>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::with_hooks(config, Box::new(SinkEgress), Box::new(NullKernel))
    }

    /// Build an engine with explicit egress and kernel hooks.
    pub fn with_hooks(
        config: EngineConfig,
        egress: Box<dyn EgressHook>,
        kernel: Box<dyn KernelHook>
    ) -> Result<Arc<Self>> {
        if config.cpus == 0 {
            return Err(SteerError::config("cpus must be greater than 0"));
        }
        if config.prefetch_len == 0 || config.prefetch_len > BATCH_LEN {
            return Err(SteerError::config("prefetch_len out of range"));
        }
        let cpus = config.cpus;
        Ok(
            Arc::new(Self {
                devmap: DevMap::new(),
                groups: GroupTable::new(cpus),
                socks: SockTable::new(cpus),
                cpu: (0..cpus).map(|_| CachePadded::new(Mutex::new(CpuContext::new()))).collect(),
                tstamp_toggle: AtomicI32::new(0),
                stats: GlobalCounters::new(cpus),
                egress,
                kernel,
                timer_stop: Arc::new(AtomicBool::new(false)),
                timer_handle: Mutex::new(None),
                config,
            })
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> GlobalStats {
        self.stats.snapshot()
    }

    // -- receive path -------------------------------------------------------

    /// Packet-source hook: admit `packet` according to the sniffing
    /// switches, then run the capture path.
    pub fn packet_rcv(&self, cpu: usize, packet: RawPacket) -> Result<()> {
        let admitted = match packet.direction {
            PacketDirection::Incoming => self.config.sniff_incoming,
            PacketDirection::Outgoing => self.config.sniff_outgoing,
            PacketDirection::Loopback => self.config.sniff_loopback,
        };
        if !admitted {
            return Ok(());
        }
        self.receive(cpu, packet, false)
    }

    /// Direct-capture hook: returns true when the engine consumed the
    /// packet, false when the caller should hand it to the regular kernel
    /// path.
    pub fn receive_direct(&self, cpu: usize, packet: RawPacket) -> Result<bool> {
        if self.config.direct_capture && self.devmap.monitor_get(packet.ifindex) {
            self.receive(cpu, packet, true)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Push one packet onto the CPU's batch arena; runs the batch processor
    /// inline when the arena reaches `prefetch_len`.
    pub fn receive(&self, cpu: usize, mut packet: RawPacket, direct: bool) -> Result<()> {
        let cell = self.cpu
            .get(cpu)
            .ok_or_else(|| SteerError::invalid_argument(format!("cpu {} out of range", cpu)))?;
        let mut ctx = cell.lock();

        // Flow-control debt from an earlier overflow.
        if ctx.flowctrl > 0 {
            ctx.flowctrl -= 1;
            return Ok(());
        }

        if self.tstamp_toggle.load(Ordering::Acquire) > 0 && packet.tstamp == 0 {
            packet.tstamp = now_nanos();
        }

        let buff = ctx.pool.acquire(packet, direct);
        ctx.last_rx = Instant::now();
        if let Err(buff) = ctx.arena.push(buff) {
            // Arena unexpectedly full: drain it, then retry.
            self.process_batch(&mut ctx, cpu);
            let _ = ctx.arena.push(buff);
        }

        if ctx.arena.len() >= self.config.prefetch_len {
            self.process_batch(&mut ctx, cpu);
        }
        Ok(())
    }

    /// Run a batch for `cpu` regardless of fill level.
    pub fn flush(&self, cpu: usize) {
        if let Some(cell) = self.cpu.get(cpu) {
            let mut ctx = cell.lock();
            if !ctx.arena.is_empty() {
                self.process_batch(&mut ctx, cpu);
            }
        }
    }

    /// Timer-driven flush: only fires when the CPU is idle and its residual
    /// packets have waited at least one period.
    fn try_flush(&self, cpu: usize) {
        if let Some(cell) = self.cpu.get(cpu) {
            if let Some(mut ctx) = cell.try_lock() {
                if !ctx.arena.is_empty() && ctx.last_rx.elapsed() >= self.config.flush_period {
                    self.process_batch(&mut ctx, cpu);
                }
            }
        }
    }

    /// Spawn the periodic flush thread. Call [`Engine::shutdown`] to stop
    /// it; the engine is kept alive by the thread until then.
    pub fn start_flush_timer(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let stop = Arc::clone(&self.timer_stop);
        let period = self.config.flush_period;
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(period);
                for cpu in 0..engine.config.cpus {
                    engine.try_flush(cpu);
                }
            }
        });
        *self.timer_handle.lock() = Some(handle);
    }

    /// Stop the flush timer, disable direct capture, and drain every CPU.
    pub fn shutdown(&self) {
        self.timer_stop.store(true, Ordering::Release);
        if let Some(handle) = self.timer_handle.lock().take() {
            let _ = handle.join();
        }
        self.devmap.monitor_reset();
        for cpu in 0..self.config.cpus {
            self.flush(cpu);
        }
    }

    // -- batch processor ----------------------------------------------------

    fn process_batch(&self, ctx: &mut CpuContext, cpu: usize) {
        let guard = epoch::pin();
        let CpuContext {
            arena,
            pool,
            counter,
            sock_eligible_mask,
            sock_cnt,
            sock_mask: weighted,
            flowctrl,
            ..
        } = ctx;

        let batch_len = arena.len();
        if batch_len == 0 {
            return;
        }

        let mut sock_queue = [0u64; MAX_SOCKETS];
        let mut all_group_mask = 0u64;
        let mut overflow = false;

        // Phase 1: group lookup and sequence assignment.
        for buff in arena.iter_mut() {
            let group_mask = self.devmap.get_groups(buff.ifindex(), buff.rx_queue());
            all_group_mask |= group_mask;
            buff.group_mask = group_mask;
            buff.counter = *counter as u64;
            *counter = counter.wrapping_add(1);
        }
        self.stats.recv.add(cpu, batch_len as u64);

        // Phase 2: per-group evaluation and fan-out.
        for gid in set_bits(all_group_mask) {
            let group = match self.groups.get(gid) {
                Some(group) => group,
                None => {
                    continue;
                }
            };

            let bp_filter = group.bp_filter(&guard);
            let vlan_enabled = group.vlan_filters_enabled();
            let comp = group.comp(&guard);
            let group_state = group.state(&guard);

            let mut refs = [false; BATCH_LEN];
            let mut socket_mask = 0u64;

            for n in 0..batch_len {
                let buff = match arena.get_mut(n) {
                    Some(buff) => buff,
                    None => {
                        break;
                    }
                };
                if buff.group_mask & (1 << gid) == 0 {
                    continue;
                }

                group.stats.recv.inc(cpu);

                if let Some(filter) = bp_filter {
                    if filter.run(&buff.packet.data) == 0 {
                        group.stats.drop.inc(cpu);
                        continue;
                    }
                }

                if vlan_enabled && !group.vlan_check(buff.packet.vlan_vid()) {
                    group.stats.drop.inc(cpu);
                    continue;
                }

                buff.state = 0;
                let mut mask = 0u64;

                if let Some(comp) = comp {
                    let to_kernel0 = buff.log.to_kernel;
                    let num_fwd0 = buff.log.num_devs;

                    let mut monad = Monad::reset(group_state);
                    let verdict = lang::run(buff, comp, &mut monad);

                    // Park the monad state and account the log deltas.
                    buff.state = monad.state;
                    group.stats.frwd.add(cpu, (buff.log.num_devs - num_fwd0) as u64);
                    group.stats.kern.add(cpu, (buff.log.to_kernel - to_kernel0) as u64);

                    let disposition = monad.action.resolve();
                    if disposition == Disposition::Steal {
                        buff.stolen = true;
                        continue;
                    }
                    if verdict == Verdict::Drop {
                        group.stats.drop.inc(cpu);
                        continue;
                    }

                    refs[n] = true;

                    let mut eligible_mask = 0u64;
                    for class in set_bits(monad.fanout.class_mask & CLASS_MASK_ALL) {
                        eligible_mask |= group.sock_id(class);
                    }

                    if disposition == Disposition::Clone {
                        // Clones bring their sockets into the enqueue pass
                        // but do not mark this batch slot for delivery.
                        socket_mask |= eligible_mask;
                        continue;
                    }

                    if monad.fanout.is_steering() {
                        if eligible_mask != *sock_eligible_mask {
                            *sock_eligible_mask = eligible_mask;
                            *sock_cnt = 0;
                            for sid in set_bits(eligible_mask) {
                                if let Some(so) = self.socks.get(sid, &guard) {
                                    for _ in 0..so.weight() {
                                        if *sock_cnt < MAX_SOCK_MASK {
                                            weighted[*sock_cnt] = 1 << sid;
                                            *sock_cnt += 1;
                                        }
                                    }
                                }
                            }
                        }

                        if *sock_cnt > 0 {
                            let cnt = *sock_cnt as u32;
                            mask |= weighted[fold(prefold(monad.fanout.hash), cnt) as usize];
                            if monad.fanout.is_double_steering() {
                                mask |= weighted[fold(prefold(monad.fanout.hash2), cnt) as usize];
                            }
                        }
                    } else {
                        // Broadcast.
                        mask |= eligible_mask;
                    }
                } else {
                    refs[n] = true;
                    mask |= group.sock_id(0);
                }

                for sid in set_bits(mask) {
                    sock_queue[sid] |= 1 << n;
                }
                socket_mask |= mask;
            }

            // Copy payloads to the selected sockets, arrival order per
            // socket.
            let arena_ref: &BatchArena = arena;
            for sid in set_bits(socket_mask) {
                let so = match self.socks.get(sid, &guard) {
                    Some(so) if so.is_active() => so,
                    _ => {
                        continue;
                    }
                };
                let queue = match so.queue(&guard) {
                    Some(queue) => queue,
                    None => {
                        continue;
                    }
                };

                let selected: Vec<&Qbuff> = set_bits(sock_queue[sid])
                    .filter(|&n| n < batch_len && refs[n])
                    .filter_map(|n| arena_ref.get(n))
                    .collect();
                if selected.is_empty() {
                    continue;
                }

                let want = selected.len();
                let sent = queue.enqueue_batch(selected, want, gid);
                so.stats.recv.add(cpu, sent as u64);
                if sent < want {
                    so.stats.lost.add(cpu, (want - sent) as u64);
                    group.stats.lost.add(cpu, (want - sent) as u64);
                    overflow = true;
                }
            }
        }

        // Phase 3: lazy egress.
        let endpoints = arena.lazy_endpoints();
        if endpoints.cnt_total > 0 {
            let mut total = 0usize;
            for buff in arena.iter() {
                for &dev in buff.log.devs() {
                    if self.egress.xmit(&buff.packet, dev) {
                        total += 1;
                    }
                }
            }
            self.stats.frwd.add(cpu, total as u64);
            self.stats.disc.add(cpu, (endpoints.cnt_total - total) as u64);
        }

        // Phase 4: kernel re-injection and release.
        for buff in arena.iter() {
            if buff.stolen {
                continue;
            }
            if buff.fwd_to_kernel() {
                self.kernel.inject(&buff.packet);
                self.stats.kern.inc(cpu);
            }
        }
        arena.reset(pool);

        if overflow && self.config.flow_control > 0 {
            *flowctrl = self.config.flow_control;
        }
    }

    // -- control surface ----------------------------------------------------

    /// Open a consumer socket; returns its id.
    pub fn socket_open(&self) -> Result<usize> {
        let guard = epoch::pin();
        let sid = self.socks.open(self.config.cap_len, self.config.queue_slots, &guard)?;
        debug!(sid, "socket open");
        Ok(sid)
    }

    /// Close a socket: leave every group, tear down the queue, release the
    /// id after the grace period.
    pub fn socket_close(&self, sid: usize) -> Result<()> {
        let guard = epoch::pin();
        let sock = self.socks.checked(sid, &guard)?;

        if sock.tstamp_enabled() {
            self.tstamp_toggle.fetch_sub(1, Ordering::AcqRel);
        }
        sock.disable(&guard);

        let emptied = self.groups.leave_all(sid, &guard);
        for gid in set_bits(emptied) {
            self.devmap.reset_group(gid);
        }

        self.socks.close(sid, &guard)?;
        debug!(sid, "socket closed");
        Ok(())
    }

    /// Enable or disable the socket's queue.
    pub fn toggle_queue(&self, sid: usize, active: bool) -> Result<()> {
        let guard = epoch::pin();
        let sock = self.socks.checked(sid, &guard)?;
        if active {
            sock.enable(&guard)?;
        } else {
            sock.disable(&guard);
        }
        Ok(())
    }

    pub fn is_active(&self, sid: usize) -> Result<bool> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.is_active())
    }

    /// Join a group; `gid = None` allocates the lowest unused group.
    pub fn group_join(
        &self,
        sid: usize,
        gid: Option<usize>,
        class_mask: u64,
        policy: GroupPolicy
    ) -> Result<usize> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?;
        let gid = match gid {
            Some(gid) => {
                self.groups.join(gid, sid, class_mask, policy)?;
                gid
            }
            None => self.groups.join_free(sid, class_mask, policy)?,
        };
        debug!(sid, gid, class_mask, "group join");
        Ok(gid)
    }

    pub fn group_leave(&self, sid: usize, gid: usize) -> Result<()> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?;
        if self.groups.leave(gid, sid, &guard)? {
            self.devmap.reset_group(gid);
        }
        debug!(sid, gid, "group leave");
        Ok(())
    }

    /// Install or clear the group's classifier program.
    pub fn set_group_computation(
        &self,
        sid: usize,
        gid: usize,
        comp: Option<Computation>
    ) -> Result<()> {
        let guard = epoch::pin();
        self.check_member(sid, gid)?;
        self.groups.checked(gid)?.set_computation(comp, &guard);
        debug!(sid, gid, "computation set");
        Ok(())
    }

    /// Install or clear the group's byte-code filter.
    pub fn set_group_filter(&self, sid: usize, gid: usize, filter: Option<BpfProgram>) -> Result<()> {
        let guard = epoch::pin();
        self.check_member(sid, gid)?;
        self.groups.checked(gid)?.set_filter(filter, &guard);
        debug!(sid, gid, "filter set");
        Ok(())
    }

    /// Install or clear the group's opaque state blob.
    pub fn set_group_state(&self, sid: usize, gid: usize, state: Option<Vec<u8>>) -> Result<()> {
        let guard = epoch::pin();
        self.check_member(sid, gid)?;
        self.groups.checked(gid)?.set_state(state, &guard);
        Ok(())
    }

    pub fn vlan_filters_toggle(&self, sid: usize, gid: usize, enable: bool) -> Result<()> {
        self.check_member(sid, gid)?;
        self.groups.checked(gid)?.vlan_toggle(enable);
        debug!(sid, gid, enable, "vlan filters toggled");
        Ok(())
    }

    /// Add or remove a VLAN id (`-1` = the whole valid range).
    pub fn vlan_set_filter(&self, sid: usize, gid: usize, vid: i32, toggle: bool) -> Result<()> {
        self.check_member(sid, gid)?;
        self.groups.vlan_set_filter(gid, vid, toggle)
    }

    /// Bind `(ifindex, rx_queue)` to the group.
    pub fn bind(&self, sid: usize, gid: usize, ifindex: u32, rx_queue: i32) -> Result<()> {
        self.check_member(sid, gid)?;
        self.devmap.update(MapUpdate::Set, ifindex, rx_queue, gid)?;
        debug!(sid, gid, ifindex, rx_queue, "bind");
        Ok(())
    }

    pub fn unbind(&self, sid: usize, gid: usize, ifindex: u32, rx_queue: i32) -> Result<()> {
        self.check_member(sid, gid)?;
        self.devmap.update(MapUpdate::Reset, ifindex, rx_queue, gid)?;
        debug!(sid, gid, ifindex, rx_queue, "unbind");
        Ok(())
    }

    /// Enable or disable direct capture from a device.
    pub fn set_monitor(&self, ifindex: u32, enable: bool) {
        self.devmap.monitor_set(ifindex, enable);
    }

    pub fn set_caplen(&self, sid: usize, caplen: usize) -> Result<()> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?.set_caplen(caplen)
    }

    pub fn caplen(&self, sid: usize) -> Result<usize> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.caplen())
    }

    pub fn set_slots(&self, sid: usize, slots: usize) -> Result<()> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?.set_slots(slots)
    }

    pub fn slots(&self, sid: usize) -> Result<usize> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.slots())
    }

    pub fn set_offset(&self, sid: usize, offset: usize) -> Result<()> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?.set_offset(offset);
        Ok(())
    }

    pub fn offset(&self, sid: usize) -> Result<usize> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.offset())
    }

    pub fn set_weight(&self, sid: usize, weight: usize) -> Result<()> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?.set_weight(weight)
    }

    /// Toggle packet timestamping for a socket; maintains the process-wide
    /// enable counter.
    pub fn set_tstamp(&self, sid: usize, enable: bool) -> Result<()> {
        let guard = epoch::pin();
        let sock = self.socks.checked(sid, &guard)?;
        let was = sock.tstamp_enabled();
        if was != enable {
            sock.set_tstamp(enable);
            let delta = if enable { 1 } else { -1 };
            self.tstamp_toggle.fetch_add(delta, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn tstamp(&self, sid: usize) -> Result<bool> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.tstamp_enabled())
    }

    pub fn sock_stats(&self, sid: usize) -> Result<SockStats> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.stats.snapshot())
    }

    /// Per-group statistics; requires the caller to be a member.
    pub fn group_stats(&self, sid: usize, gid: usize) -> Result<GroupStats> {
        if gid >= MAX_GROUPS {
            return Err(SteerError::InvalidGroup { gid: gid as isize });
        }
        self.check_member(sid, gid)?;
        Ok(self.groups.checked(gid)?.stats.snapshot())
    }

    /// Bitmask of groups the socket has joined.
    pub fn groups_of(&self, sid: usize) -> Result<u64> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?;
        Ok(self.groups.groups_of(sid))
    }

    /// Bytes of the socket's mapped queue region.
    pub fn queue_mem(&self, sid: usize) -> Result<usize> {
        let guard = epoch::pin();
        Ok(self.socks.checked(sid, &guard)?.queue_mem(&guard))
    }

    /// Poll: true when the queue fill has reached half the slots.
    pub fn poll(&self, sid: usize) -> Result<bool> {
        let guard = epoch::pin();
        let sock = self.socks.checked(sid, &guard)?;
        match sock.queue(&guard) {
            Some(queue) => Ok(queue.poll_readable()),
            None => Err(SteerError::QueueDisabled),
        }
    }

    /// Consumer-side read of up to `max` slots.
    pub fn read_batch(&self, sid: usize, max: usize) -> Result<Vec<CapturedSlot>> {
        let guard = epoch::pin();
        let sock = self.socks.checked(sid, &guard)?;
        match sock.queue(&guard) {
            Some(queue) => Ok(queue.try_read_batch(max)),
            None => Err(SteerError::QueueDisabled),
        }
    }

    fn check_member(&self, sid: usize, gid: usize) -> Result<()> {
        let guard = epoch::pin();
        self.socks.checked(sid, &guard)?;
        if !self.groups.has_joined(gid, sid) {
            return Err(SteerError::PermissionDenied { gid });
        }
        Ok(())
    }

    #[cfg(test)]
    fn arena_len(&self, cpu: usize) -> usize {
        self.cpu[cpu].lock().arena.len()
    }
}
