//! NI-DAQmx driver
//!
//! Thin safe wrapper over the NI-DAQmx C API. Only the calls the engine
//! needs are declared: task lifecycle, AO voltage channels with a
//! continuous sample clock, DO lines, the shared start trigger, and the
//! generated-sample counter.
//!
//! Requires the NI-DAQmx runtime to be installed; the `nidaqmx` cargo
//! feature links `libnidaqmx`.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_uint, c_ulonglong, c_void};

use crate::{DaqDriver, DaqError, DaqResult, DeviceDescriptor, OutputSession, SessionConfig};

type TaskHandle = *mut c_void;

const DAQMX_VAL_CONT_SAMPS: c_int = 10123;
const DAQMX_VAL_GROUP_BY_SCAN_NUMBER: c_int = 0;
const DAQMX_VAL_RISING: c_int = 10280;
const DAQMX_VAL_CHAN_PER_LINE: c_int = 0;
const DAQMX_VAL_VOLTS: c_int = 10348;

const AO_VOLTAGE_RANGE: (f64, f64) = (-10.0, 10.0);
const WRITE_TIMEOUT_S: f64 = 10.0;

#[link(name = "nidaqmx")]
extern "C" {
    fn DAQmxCreateTask(name: *const c_char, handle: *mut TaskHandle) -> c_int;
    fn DAQmxClearTask(handle: TaskHandle) -> c_int;
    fn DAQmxStartTask(handle: TaskHandle) -> c_int;
    fn DAQmxStopTask(handle: TaskHandle) -> c_int;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        physical_channel: *const c_char,
        name: *const c_char,
        min_val: c_double,
        max_val: c_double,
        units: c_int,
        custom_scale: *const c_char,
    ) -> c_int;
    fn DAQmxCreateDOChan(
        handle: TaskHandle,
        lines: *const c_char,
        name: *const c_char,
        line_grouping: c_int,
    ) -> c_int;

    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        source: *const c_char,
        rate: c_double,
        active_edge: c_int,
        sample_mode: c_int,
        samps_per_chan: c_ulonglong,
    ) -> c_int;
    fn DAQmxCfgOutputBuffer(handle: TaskHandle, num_samps_per_chan: c_uint) -> c_int;
    fn DAQmxCfgDigEdgeStartTrig(
        handle: TaskHandle,
        trigger_source: *const c_char,
        trigger_edge: c_int,
    ) -> c_int;

    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        num_samps_per_chan: c_int,
        auto_start: c_uint,
        timeout: c_double,
        data_layout: c_int,
        data: *const c_double,
        samps_written: *mut c_int,
        reserved: *mut c_void,
    ) -> c_int;
    fn DAQmxWriteDigitalLines(
        handle: TaskHandle,
        num_samps_per_chan: c_int,
        auto_start: c_uint,
        timeout: c_double,
        data_layout: c_int,
        data: *const u8,
        samps_written: *mut c_int,
        reserved: *mut c_void,
    ) -> c_int;

    fn DAQmxGetWriteTotalSampPerChanGenerated(handle: TaskHandle, value: *mut c_ulonglong) -> c_int;
    fn DAQmxGetWriteSpaceAvail(handle: TaskHandle, value: *mut c_uint) -> c_int;

    fn DAQmxGetSysDevNames(value: *mut c_char, size: c_uint) -> c_int;
    fn DAQmxGetDevProductType(device: *const c_char, value: *mut c_char, size: c_uint) -> c_int;
    fn DAQmxGetDevProductCategory(device: *const c_char, value: *mut c_int) -> c_int;
    fn DAQmxGetDevAOMaxRate(device: *const c_char, value: *mut c_double) -> c_int;
    fn DAQmxGetDevAOPhysicalChans(device: *const c_char, value: *mut c_char, size: c_uint) -> c_int;
    fn DAQmxGetDevDOLines(device: *const c_char, value: *mut c_char, size: c_uint) -> c_int;

    fn DAQmxGetSysNIDAQMajorVersion(value: *mut c_uint) -> c_int;
    fn DAQmxGetSysNIDAQMinorVersion(value: *mut c_uint) -> c_int;
    fn DAQmxGetSysNIDAQUpdateVersion(value: *mut c_uint) -> c_int;

    fn DAQmxGetExtendedErrorInfo(buffer: *mut c_char, size: c_uint) -> c_int;
}

/// DAQmxWriteAnalogF64 reports this code when the generation ran ahead of
/// the host (regeneration of old data occurred).
const DAQMX_WARN_REGENERATION: c_int = 200015;

fn check(code: c_int) -> DaqResult<()> {
    if code == 0 || code == DAQMX_WARN_REGENERATION {
        return Ok(());
    }
    let mut buffer = vec![0 as c_char; 2048];
    // SAFETY: buffer outlives the call and the size matches.
    unsafe { DAQmxGetExtendedErrorInfo(buffer.as_mut_ptr(), buffer.len() as c_uint) };
    let message = unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    if code < 0 {
        Err(DaqError::Driver(format!("DAQmx error {}: {}", code, message)))
    } else {
        log::warn!("DAQmx warning {}: {}", code, message);
        Ok(())
    }
}

fn query_string(
    f: unsafe extern "C" fn(*const c_char, *mut c_char, c_uint) -> c_int,
    device: &CStr,
) -> DaqResult<String> {
    let mut buffer = vec![0 as c_char; 2048];
    check(unsafe { f(device.as_ptr(), buffer.as_mut_ptr(), buffer.len() as c_uint) })?;
    Ok(unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .into_owned())
}

/// Driver backed by the installed NI-DAQmx runtime.
pub struct NidaqmxDriver;

impl NidaqmxDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NidaqmxDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqDriver for NidaqmxDriver {
    fn devices(&self) -> DaqResult<Vec<DeviceDescriptor>> {
        let mut names = vec![0 as c_char; 2048];
        check(unsafe { DAQmxGetSysDevNames(names.as_mut_ptr(), names.len() as c_uint) })?;
        let names = unsafe { CStr::from_ptr(names.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut devices = Vec::new();
        for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let cname = CString::new(name).map_err(|e| DaqError::Driver(e.to_string()))?;

            let product_type = query_string(DAQmxGetDevProductType, &cname)?;
            let mut category: c_int = 0;
            check(unsafe { DAQmxGetDevProductCategory(cname.as_ptr(), &mut category) })?;
            let mut max_rate: c_double = 0.0;
            check(unsafe { DAQmxGetDevAOMaxRate(cname.as_ptr(), &mut max_rate) })?;

            let ao_chans = query_string(DAQmxGetDevAOPhysicalChans, &cname)?;
            let do_lines = query_string(DAQmxGetDevDOLines, &cname)?;
            let count = |list: &str| list.split(',').filter(|s| !s.trim().is_empty()).count() as u32;

            devices.push(DeviceDescriptor {
                name: name.to_string(),
                product_type,
                product_category: format!("category:{}", category),
                max_ao_rate_hz: max_rate,
                ao_line_count: count(&ao_chans),
                do_line_count: count(&do_lines),
            });
        }
        Ok(devices)
    }

    fn driver_version(&self) -> Option<String> {
        let mut major: c_uint = 0;
        let mut minor: c_uint = 0;
        let mut update: c_uint = 0;
        let ok = unsafe {
            DAQmxGetSysNIDAQMajorVersion(&mut major) == 0
                && DAQmxGetSysNIDAQMinorVersion(&mut minor) == 0
                && DAQmxGetSysNIDAQUpdateVersion(&mut update) == 0
        };
        ok.then(|| format!("DAQmx {}.{}.{}", major, minor, update))
    }

    fn open(&self, config: &SessionConfig) -> DaqResult<Box<dyn OutputSession>> {
        NidaqmxSession::open(config).map(|s| Box::new(s) as Box<dyn OutputSession>)
    }
}

/// One AO task plus one DO task. The DO write is on-demand; AO owns the
/// sample clock and exports `ao/StartTrigger` so the tasks start together.
pub struct NidaqmxSession {
    ao_task: TaskHandle,
    do_task: TaskHandle,
    do_line_count: usize,
    ao_count: usize,
    buffer_capacity: usize,
    /// Conversion scratch, rotated every write.
    scratch: Vec<c_double>,
    underflows: u32,
}

// SAFETY: task handles are only touched from the owning pump thread.
unsafe impl Send for NidaqmxSession {}

impl NidaqmxSession {
    fn open(config: &SessionConfig) -> DaqResult<Self> {
        let mut ao_task: TaskHandle = std::ptr::null_mut();
        let mut do_task: TaskHandle = std::ptr::null_mut();
        let empty = CString::new("").unwrap();

        check(unsafe { DAQmxCreateTask(empty.as_ptr(), &mut ao_task) })?;
        if let Err(e) = Self::configure(config, ao_task, &mut do_task) {
            unsafe {
                DAQmxClearTask(ao_task);
                if !do_task.is_null() {
                    DAQmxClearTask(do_task);
                }
            }
            return Err(e);
        }

        Ok(Self {
            ao_task,
            do_task,
            do_line_count: config.channels.do_channels.len(),
            ao_count: config.channels.ao_count(),
            buffer_capacity: config.buffer_capacity(),
            scratch: Vec::new(),
            underflows: 0,
        })
    }

    fn configure(
        config: &SessionConfig,
        ao_task: TaskHandle,
        do_task: &mut TaskHandle,
    ) -> DaqResult<()> {
        let empty = CString::new("").unwrap();

        for channel in &config.channels.ao_channels {
            let physical = CString::new(format!("{}/{}", config.device_name, channel))
                .map_err(|e| DaqError::TaskCreation(e.to_string()))?;
            check(unsafe {
                DAQmxCreateAOVoltageChan(
                    ao_task,
                    physical.as_ptr(),
                    empty.as_ptr(),
                    AO_VOLTAGE_RANGE.0,
                    AO_VOLTAGE_RANGE.1,
                    DAQMX_VAL_VOLTS,
                    std::ptr::null(),
                )
            })?;
        }
        check(unsafe {
            DAQmxCfgSampClkTiming(
                ao_task,
                std::ptr::null(),
                f64::from(config.sample_rate_hz),
                DAQMX_VAL_RISING,
                DAQMX_VAL_CONT_SAMPS,
                (config.samples_per_frame * config.frames_per_buffer) as c_ulonglong,
            )
        })?;
        check(unsafe {
            DAQmxCfgOutputBuffer(
                ao_task,
                (config.samples_per_frame * config.frames_per_buffer) as c_uint,
            )
        })?;

        check(unsafe { DAQmxCreateTask(empty.as_ptr(), do_task) })?;
        for line in &config.channels.do_channels {
            let physical = CString::new(format!("{}/{}", config.device_name, line))
                .map_err(|e| DaqError::TaskCreation(e.to_string()))?;
            check(unsafe {
                DAQmxCreateDOChan(
                    *do_task,
                    physical.as_ptr(),
                    empty.as_ptr(),
                    DAQMX_VAL_CHAN_PER_LINE,
                )
            })?;
        }

        // DO rides on the AO start trigger so the sync edge lands on the
        // first generated sample.
        let trigger = CString::new(format!("/{}/ao/StartTrigger", config.device_name))
            .map_err(|e| DaqError::TaskCreation(e.to_string()))?;
        check(unsafe { DAQmxCfgDigEdgeStartTrig(*do_task, trigger.as_ptr(), DAQMX_VAL_RISING) })?;

        Ok(())
    }

    fn write_lines(&mut self, high: bool) -> DaqResult<()> {
        let data = vec![u8::from(high); self.do_line_count];
        let mut written: c_int = 0;
        check(unsafe {
            DAQmxWriteDigitalLines(
                self.do_task,
                1,
                1,
                WRITE_TIMEOUT_S,
                DAQMX_VAL_GROUP_BY_SCAN_NUMBER,
                data.as_ptr(),
                &mut written,
                std::ptr::null_mut(),
            )
        })
    }
}

impl OutputSession for NidaqmxSession {
    fn start(&mut self) -> DaqResult<()> {
        check(unsafe { DAQmxStartTask(self.ao_task) })
    }

    fn stop(&mut self) -> DaqResult<()> {
        check(unsafe { DAQmxStopTask(self.ao_task) })
    }

    fn write(&mut self, interleaved: &[f32]) -> DaqResult<()> {
        self.scratch.clear();
        self.scratch.extend(interleaved.iter().map(|&s| c_double::from(s)));

        let frames = interleaved.len() / self.ao_count;
        let mut written: c_int = 0;
        let code = unsafe {
            DAQmxWriteAnalogF64(
                self.ao_task,
                frames as c_int,
                0,
                WRITE_TIMEOUT_S,
                DAQMX_VAL_GROUP_BY_SCAN_NUMBER,
                self.scratch.as_ptr(),
                &mut written,
                std::ptr::null_mut(),
            )
        };
        if code == DAQMX_WARN_REGENERATION {
            self.underflows += 1;
            return Ok(());
        }
        check(code)
    }

    fn set_sync_lines(&mut self, high: bool) -> DaqResult<()> {
        self.write_lines(high)
    }

    fn samples_generated(&self) -> u64 {
        let mut value: c_ulonglong = 0;
        let code = unsafe { DAQmxGetWriteTotalSampPerChanGenerated(self.ao_task, &mut value) };
        if code == 0 {
            value
        } else {
            0
        }
    }

    fn buffer_slots(&self) -> usize {
        let mut value: c_uint = 0;
        let code = unsafe { DAQmxGetWriteSpaceAvail(self.ao_task, &mut value) };
        if code == 0 {
            (value as usize * self.ao_count).min(self.buffer_capacity)
        } else {
            0
        }
    }

    fn take_underflows(&mut self) -> u32 {
        std::mem::take(&mut self.underflows)
    }
}

impl Drop for NidaqmxSession {
    fn drop(&mut self) {
        let _ = self.write_lines(false);
        unsafe {
            DAQmxStopTask(self.ao_task);
            DAQmxClearTask(self.ao_task);
            DAQmxStopTask(self.do_task);
            DAQmxClearTask(self.do_task);
        }
    }
}
