//! The root hub: port power, resets and connection changes.

use super::*;

impl OhciState {
    /// Detects how ports are powered, powers them and returns the ports with
    /// a device attached. Enables root hub status change interrupts last.
    pub(super) fn setup_root_hub(&mut self) -> Vec<usize> {
        let mut descriptor = self.regs.descriptor_a();

        self.power_mode = if descriptor.no_power_switching() {
            PowerMode::AlwaysOn
        } else if descriptor.power_switching_mode() {
            PowerMode::PerPort
        } else {
            PowerMode::Global
        };

        self.ports = (descriptor.downstream_ports() as usize).min(MAX_PORTS);
        self.power_on_delay_ms = (descriptor.power_on_to_good() as u64 * 2).max(MIN_POWER_ON_DELAY_MS);

        // we are not a compound device
        descriptor.set_device_type(false);
        self.regs.set_descriptor_a(descriptor);

        match self.power_mode {
            PowerMode::AlwaysOn => {}
            PowerMode::Global => self.regs.set_rh_status(RhStatus::LOCAL_POWER_STATUS_CHANGE),
            PowerMode::PerPort => {
                // port power control mask: every port is switched on its own
                let mask = ((1u32 << self.ports) - 1) << 17;
                self.regs.write(Register::RhDescriptorB, mask);
                for port in 0..self.ports {
                    self.regs.write_port(port, PortFlags::PORT_POWER_STATUS);
                }
            }
        }
        self.timer.delay_ms(self.power_on_delay_ms);

        info!(
            "[USB-OHCI] Root hub: {} ports, power {:?}, power-on delay {} ms",
            self.ports, self.power_mode, self.power_on_delay_ms
        );

        let connected = (0..self.ports)
            .filter(|port| self.regs.port(*port).contains(PortFlags::CURRENT_CONNECT_STATUS))
            .collect();

        self.regs.acknowledge(Interrupts::all());
        self.regs.enable_interrupts(Interrupts::ROOT_HUB_STATUS_CHANGE);
        connected
    }

    fn check_port(&self, port: usize) -> Result<(), UsbError> {
        match port < self.ports {
            true => Ok(()),
            false => Err(UsbError::InvalidState),
        }
    }

    /// Resets `port` and enables it once the reset is over.
    pub(super) fn port_reset(&mut self, port: usize) -> Result<(), UsbError> {
        self.check_port(port)?;

        self.regs.write_port(port, PortFlags::PORT_RESET_STATUS);
        let regs = &self.regs;
        try_wait_until!(
            self.timer,
            PORT_RESET_POLL_MS,
            PORT_RESET_TIMEOUT_MS,
            !regs.port(port).contains(PortFlags::PORT_RESET_STATUS)
        )?;

        let mut enable = PortFlags::PORT_ENABLE_STATUS;
        if self.power_mode == PowerMode::PerPort {
            enable |= PortFlags::PORT_POWER_STATUS;
        }
        self.regs.write_port(port, enable);
        self.timer.delay_ms(PORT_RESET_STALL_MS);
        Ok(())
    }

    pub(super) fn port_status(&mut self, port: usize) -> Result<PortStatus, UsbError> {
        self.check_port(port)?;

        self.timer.delay_ms(self.power_on_delay_ms);
        self.port_reset(port)?;

        let flags = self.regs.port(port);
        let status = PortStatus {
            connected: flags.contains(PortFlags::CURRENT_CONNECT_STATUS),
            enabled: flags.contains(PortFlags::PORT_ENABLE_STATUS),
            full_speed: !flags.contains(PortFlags::LOW_SPEED_DEVICE_ATTACHED),
        };

        self.regs.write_port(port, flags & PortFlags::CHANGE_BITS);
        debug!("[USB-OHCI] Port {}: {:?}", port, status);
        Ok(status)
    }

    /// Reports every connection change on the root hub.
    pub(super) fn ports_check(&mut self) -> Result<Vec<HcdEvent>, UsbError> {
        let mut events = Vec::new();

        for port in 0..self.ports {
            let flags = self.regs.port(port);
            if !flags.contains(PortFlags::CONNECT_STATUS_CHANGE) {
                continue;
            }

            if flags.contains(PortFlags::CURRENT_CONNECT_STATUS) {
                self.port_reset(port)?;
            }

            let flags = self.regs.port(port);
            if !flags.contains(PortFlags::CURRENT_CONNECT_STATUS) {
                info!("[USB-OHCI] Device left port {}", port);
                events.push(HcdEvent::Disconnected(port));
            } else if flags.contains(PortFlags::PORT_ENABLE_STATUS | PortFlags::PORT_POWER_STATUS) {
                info!("[USB-OHCI] Device attached to port {}", port);
                events.push(HcdEvent::Connected(port));
            }

            self.regs.write_port(port, PortFlags::CONNECT_STATUS_CHANGE);
        }

        Ok(events)
    }
}
