/*!
Typed I/O interconnect.

Devices register in order (their id is their registration rank) and expose
a client trait with one handler per message flavor; the default handlers
reject the flavor, which surfaces to the originator as a protocol error
rather than aborting the simulation. Each device owns an incoming buffer
drained by a delivery process, so a slow device back-pressures its senders
without stalling the rest of the fabric.

Devices are also reachable by name; lookup supports `*` and `?` glob
patterns.
*/

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::kernel::{
    BufferHandle, ClockId, Component, ComponentId, ProcessId, SimCtx, StepResult,
};
use crate::mem::MemAddr;

/// Device id: assigned in order of registration.
pub type IoDeviceId = usize;
/// Notification channel id.
pub type IoChannelId = usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("device {device} does not implement {flavor}")]
    Unsupported {
        device: IoDeviceId,
        flavor: &'static str,
    },
}

/// The six message flavors of the interconnect.
#[derive(Debug, Clone)]
pub enum IoPayload {
    ReadRequest {
        from: IoDeviceId,
        addr: MemAddr,
        size: usize,
    },
    ReadResponse {
        from: IoDeviceId,
        addr: MemAddr,
        data: Vec<u8>,
    },
    WriteRequest {
        from: IoDeviceId,
        addr: MemAddr,
        data: Vec<u8>,
    },
    InterruptRequest {
        channel: IoChannelId,
    },
    Notification {
        channel: IoChannelId,
        tag: u64,
    },
    ActiveMessage {
        from: IoDeviceId,
        pc: MemAddr,
        arg: u64,
    },
}

impl IoPayload {
    fn flavor(&self) -> &'static str {
        match self {
            IoPayload::ReadRequest { .. } => "read requests",
            IoPayload::ReadResponse { .. } => "read responses",
            IoPayload::WriteRequest { .. } => "write requests",
            IoPayload::InterruptRequest { .. } => "interrupt requests",
            IoPayload::Notification { .. } => "notifications",
            IoPayload::ActiveMessage { .. } => "active messages",
        }
    }
}

/// Handlers a device implements for the flavors it supports. Returning
/// `false` back-pressures the delivery; the message is retried.
pub trait IoMessageClient {
    fn on_read_request(
        &mut self,
        from: IoDeviceId,
        _addr: MemAddr,
        _size: usize,
    ) -> Result<bool, ProtocolError> {
        Err(ProtocolError::Unsupported {
            device: from,
            flavor: "read requests",
        })
    }

    fn on_read_response(
        &mut self,
        from: IoDeviceId,
        _addr: MemAddr,
        _data: &[u8],
    ) -> Result<bool, ProtocolError> {
        Err(ProtocolError::Unsupported {
            device: from,
            flavor: "read responses",
        })
    }

    fn on_write_request(
        &mut self,
        from: IoDeviceId,
        _addr: MemAddr,
        _data: &[u8],
    ) -> Result<bool, ProtocolError> {
        Err(ProtocolError::Unsupported {
            device: from,
            flavor: "write requests",
        })
    }

    fn on_interrupt_request(&mut self, _channel: IoChannelId) -> Result<bool, ProtocolError> {
        Ok(true)
    }

    fn on_notification(
        &mut self,
        _channel: IoChannelId,
        _tag: u64,
    ) -> Result<bool, ProtocolError> {
        Ok(true)
    }

    fn on_active_message(
        &mut self,
        from: IoDeviceId,
        _pc: MemAddr,
        _arg: u64,
    ) -> Result<bool, ProtocolError> {
        Err(ProtocolError::Unsupported {
            device: from,
            flavor: "active messages",
        })
    }
}

pub type IoClient = Rc<RefCell<dyn IoMessageClient>>;

struct Receiver {
    name: String,
    client: IoClient,
    incoming: BufferHandle<IoPayload>,
    /// Errors bounced back to the originator.
    errors: Rc<RefCell<Vec<(IoDeviceId, ProtocolError)>>>,
}

/// The interconnect component.
pub struct IoMessageInterface {
    comp: ComponentId,
    clock: ClockId,
    buffer_size: usize,
    receivers: Vec<Receiver>,
    /// Interrupt listeners per notification channel.
    channels: Vec<Vec<IoDeviceId>>,
    errors: Rc<RefCell<Vec<(IoDeviceId, ProtocolError)>>>,
}

impl IoMessageInterface {
    pub fn new(ctx: &mut SimCtx, clock: ClockId, buffer_size: usize) -> Self {
        let comp = ctx.allocate_component("ioif");
        IoMessageInterface {
            comp,
            clock,
            buffer_size,
            receivers: Vec::new(),
            channels: Vec::new(),
            errors: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn component_id(&self) -> ComponentId {
        self.comp
    }

    /// Register a device; ids follow registration order.
    pub fn register_device(
        &mut self,
        ctx: &mut SimCtx,
        name: &str,
        client: IoClient,
    ) -> Result<IoDeviceId, ConfigError> {
        if self.receivers.iter().any(|r| r.name == name) {
            return Err(ConfigError::Invalid(format!(
                "device name `{name}` is already registered"
            )));
        }
        let id = self.receivers.len();
        let incoming = ctx.create_buffer::<IoPayload>(
            &format!("ioif.{name}.b_incoming"),
            self.clock,
            self.buffer_size,
            2,
        );
        let pid = ctx.register_process(self.comp, id, &format!("{name}.deliver"), self.clock);
        ctx.sensitive(incoming.storage_id(), pid);
        self.receivers.push(Receiver {
            name: name.to_string(),
            client,
            incoming,
            errors: self.errors.clone(),
        });
        Ok(id)
    }

    /// Queue a message for `to`. `false` means the device's buffer is full.
    pub fn send(&self, ctx: &mut SimCtx, to: IoDeviceId, payload: IoPayload) -> bool {
        self.receivers[to].incoming.push(ctx, payload, 0)
    }

    /// The delivery process of `to` (for senders' storage traces).
    pub fn incoming_storage(&self, to: IoDeviceId) -> crate::kernel::StorageId {
        self.receivers[to].incoming.storage_id()
    }

    /// Exact name lookup.
    pub fn device_by_name(&self, name: &str) -> Option<IoDeviceId> {
        self.receivers.iter().position(|r| r.name == name)
    }

    /// All devices whose name matches a `*`/`?` glob pattern, in id order.
    pub fn devices_matching(&self, pattern: &str) -> Vec<IoDeviceId> {
        self.receivers
            .iter()
            .enumerate()
            .filter(|(_, r)| glob_match(pattern, &r.name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Protocol errors delivered so far: (offending device, error).
    pub fn take_errors(&self) -> Vec<(IoDeviceId, ProtocolError)> {
        std::mem::take(&mut self.errors.borrow_mut())
    }

    /// Subscribe a device to an interrupt channel.
    pub fn subscribe(&mut self, channel: IoChannelId, device: IoDeviceId) {
        if self.channels.len() <= channel {
            self.channels.resize_with(channel + 1, Vec::new);
        }
        if !self.channels[channel].contains(&device) {
            self.channels[channel].push(device);
        }
    }

    /// Raise an interrupt: one request to every subscriber of the channel.
    /// All-or-nothing; `false` when any subscriber's buffer is full.
    pub fn raise_interrupt(&self, ctx: &mut SimCtx, channel: IoChannelId) -> bool {
        let Some(listeners) = self.channels.get(channel) else {
            return true;
        };
        if listeners
            .iter()
            .any(|&d| !self.receivers[d].incoming.can_push(ctx, 0))
        {
            return false;
        }
        for &d in listeners {
            self.receivers[d]
                .incoming
                .push(ctx, IoPayload::InterruptRequest { channel }, 0);
        }
        true
    }
}

impl Component for IoMessageInterface {
    fn name(&self) -> &str {
        "ioif"
    }

    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        let receiver = &self.receivers[local];
        let payload = receiver.incoming.front(ctx);
        if ctx.committing() {
            let mut client = receiver.client.borrow_mut();
            let delivered = match &payload {
                IoPayload::ReadRequest { from, addr, size } => {
                    client.on_read_request(*from, *addr, *size)
                }
                IoPayload::ReadResponse { from, addr, data } => {
                    client.on_read_response(*from, *addr, data)
                }
                IoPayload::WriteRequest { from, addr, data } => {
                    client.on_write_request(*from, *addr, data)
                }
                IoPayload::InterruptRequest { channel } => client.on_interrupt_request(*channel),
                IoPayload::Notification { channel, tag } => client.on_notification(*channel, *tag),
                IoPayload::ActiveMessage { from, pc, arg } => {
                    client.on_active_message(*from, *pc, *arg)
                }
            };
            match delivered {
                Ok(true) => {}
                Ok(false) => return StepResult::Failed,
                Err(e) => {
                    // Unsupported flavor: report to the originator, consume
                    // the message.
                    log::debug!("ioif.{}: {} rejected: {e}", receiver.name, payload.flavor());
                    receiver.errors.borrow_mut().push((local, e));
                }
            }
        }
        receiver.incoming.pop(ctx);
        StepResult::Success
    }
}

/// Minimal `*`/`?` glob matcher over byte strings.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<u8> = pattern.bytes().collect();
    let n: Vec<u8> = name.bytes().collect();
    // Classic two-pointer scan with one backtrack point for `*`.
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Simulation;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("uart*", "uart0"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("disk?", "disk1"));
        assert!(!glob_match("disk?", "disk12"));
        assert!(glob_match("*rtc*", "the-rtc-device"));
        assert!(!glob_match("uart*", "disk0"));
    }

    struct Sink {
        notifications: Vec<(IoChannelId, u64)>,
    }

    impl IoMessageClient for Sink {
        fn on_notification(
            &mut self,
            channel: IoChannelId,
            tag: u64,
        ) -> Result<bool, ProtocolError> {
            self.notifications.push((channel, tag));
            Ok(true)
        }
    }

    #[test]
    fn delivery_and_protocol_errors() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("io", 1);
        let mut iface = IoMessageInterface::new(&mut sim.ctx, clk, 4);
        let iface_comp = iface.component_id();

        let sink = Rc::new(RefCell::new(Sink {
            notifications: Vec::new(),
        }));
        let uart = iface
            .register_device(&mut sim.ctx, "uart0", sink.clone())
            .unwrap();
        let disk = iface
            .register_device(&mut sim.ctx, "disk0", sink.clone())
            .unwrap();
        assert_eq!(uart, 0);
        assert_eq!(disk, 1);
        assert_eq!(iface.device_by_name("disk0"), Some(1));
        assert_eq!(iface.devices_matching("*0"), vec![0, 1]);

        // Drive sends from a driver component.
        struct Driver {
            iface: Rc<RefCell<IoMessageInterface>>,
            go: crate::kernel::FlagHandle,
            sent: bool,
        }
        impl Component for Driver {
            fn name(&self) -> &str {
                "driver"
            }
            fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
                if self.sent {
                    self.go.clear(ctx);
                    return StepResult::Success;
                }
                let iface = self.iface.borrow();
                if !iface.send(ctx, 0, IoPayload::Notification { channel: 3, tag: 7 }) {
                    return StepResult::Failed;
                }
                // An unsupported flavor for the same device.
                if !iface.send(
                    ctx,
                    0,
                    IoPayload::ActiveMessage {
                        from: 1,
                        pc: 0x100,
                        arg: 9,
                    },
                ) {
                    return StepResult::Failed;
                }
                drop(iface);
                if ctx.committing() {
                    self.sent = true;
                }
                StepResult::Success
            }
        }

        let iface = Rc::new(RefCell::new(iface));
        let comp = sim.ctx.allocate_component("driver");
        let pid = sim.ctx.register_process(comp, 0, "pump", clk);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), pid);

        // The interface component is driven through a forwarding shim that
        // shares ownership with the driver.
        struct Shim {
            iface: Rc<RefCell<IoMessageInterface>>,
        }
        impl Component for Shim {
            fn name(&self) -> &str {
                "ioif"
            }
            fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
                self.iface.borrow_mut().step(local, ctx)
            }
        }
        sim.install(
            iface_comp,
            Box::new(Shim {
                iface: iface.clone(),
            }),
        );
        sim.install(
            comp,
            Box::new(Driver {
                iface: iface.clone(),
                go,
                sent: false,
            }),
        );

        sim.run_until_idle(50).unwrap();
        assert_eq!(sink.borrow().notifications, vec![(3, 7)]);
        let errors = iface.borrow().take_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].1, ProtocolError::Unsupported { .. }));
    }

    struct IntCounter {
        interrupts: Vec<IoChannelId>,
    }

    impl IoMessageClient for IntCounter {
        fn on_interrupt_request(&mut self, channel: IoChannelId) -> Result<bool, ProtocolError> {
            self.interrupts.push(channel);
            Ok(true)
        }
    }

    #[test]
    fn interrupts_broadcast_to_channel_subscribers() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("io", 1);
        let mut iface = IoMessageInterface::new(&mut sim.ctx, clk, 4);
        let iface_comp = iface.component_id();

        let a = Rc::new(RefCell::new(IntCounter { interrupts: vec![] }));
        let b = Rc::new(RefCell::new(IntCounter { interrupts: vec![] }));
        let c = Rc::new(RefCell::new(IntCounter { interrupts: vec![] }));
        let da = iface.register_device(&mut sim.ctx, "timer", a.clone()).unwrap();
        let db = iface.register_device(&mut sim.ctx, "uart", b.clone()).unwrap();
        let _dc = iface.register_device(&mut sim.ctx, "disk", c.clone()).unwrap();
        iface.subscribe(5, da);
        iface.subscribe(5, db);

        struct Raiser {
            iface: Rc<RefCell<IoMessageInterface>>,
            go: crate::kernel::FlagHandle,
            raised: bool,
        }
        impl Component for Raiser {
            fn name(&self) -> &str {
                "raiser"
            }
            fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
                if self.raised {
                    self.go.clear(ctx);
                    return StepResult::Delayed;
                }
                if !self.iface.borrow().raise_interrupt(ctx, 5) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.raised = true;
                }
                StepResult::Success
            }
        }

        let iface = Rc::new(RefCell::new(iface));
        let comp = sim.ctx.allocate_component("raiser");
        let pid = sim.ctx.register_process(comp, 0, "raise", clk);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), pid);

        struct Shim {
            iface: Rc<RefCell<IoMessageInterface>>,
        }
        impl Component for Shim {
            fn name(&self) -> &str {
                "ioif"
            }
            fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
                self.iface.borrow_mut().step(local, ctx)
            }
        }
        sim.install(iface_comp, Box::new(Shim { iface: iface.clone() }));
        sim.install(
            comp,
            Box::new(Raiser {
                iface: iface.clone(),
                go,
                raised: false,
            }),
        );
        sim.run_until_idle(50).unwrap();
        assert_eq!(a.borrow().interrupts, vec![5]);
        assert_eq!(b.borrow().interrupts, vec![5]);
        assert!(c.borrow().interrupts.is_empty());
    }
}
