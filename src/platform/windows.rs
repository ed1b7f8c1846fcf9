//! Win32 implementation of the host platform and COM handoff activation.

use std::ffi::c_void;
use std::io::{self, Read};

use tracing::{debug, warn};
use windows::core::{interface, IUnknown, IUnknown_Vtbl, GUID, HRESULT, PCWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_HANDLE_OPTIONS, ERROR_BROKEN_PIPE, HANDLE,
};
use windows::Win32::Storage::FileSystem::ReadFile;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_LOCAL_SERVER, COINIT_MULTITHREADED,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows::Win32::System::StationsAndDesktops::{
    GetProcessWindowStation, GetUserObjectInformationW, UOI_FLAGS, USEROBJECTFLAGS,
};
use windows::Win32::System::Threading::{
    CreateEventW, GetCurrentProcess, GetCurrentProcessId, WaitForSingleObject, INFINITE,
    PROCESS_SYNCHRONIZE,
};

use super::{HostPlatform, KernelObject, OwnedHandle, PlatformError, RawHandle, SignalPipe};
use crate::server::handoff::{
    ConsoleHandoff, HandoffActivator, HandoffError, HandoffTargetId, PortableAttachMsg,
};

const WSF_VISIBLE: u32 = 0x0001;

fn os_error(e: windows::core::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// An owned Win32 handle, closed on drop
#[derive(Debug)]
pub struct Win32Handle(HANDLE);

// Safety: a kernel handle may be used and closed from any thread
unsafe impl Send for Win32Handle {}

impl KernelObject for Win32Handle {
    fn raw(&self) -> RawHandle {
        RawHandle(self.0 .0 as usize)
    }
}

impl Read for Win32Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read: u32 = 0;
        let result = unsafe { ReadFile(self.0, Some(buf), Some(&mut read), None) };
        match result {
            Ok(()) => Ok(read as usize),
            // Writer closed its end
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
            Err(e) => Err(os_error(e)),
        }
    }
}

impl Drop for Win32Handle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

#[derive(Debug, Default)]
pub struct Win32Platform;

impl HostPlatform for Win32Platform {
    fn is_interactive_session(&self) -> bool {
        unsafe {
            let mut session_id = 0u32;
            if ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id).is_ok() && session_id == 0 {
                return false;
            }

            // Not closed: the station handle belongs to the process
            let Ok(station) = GetProcessWindowStation() else {
                return true;
            };
            let mut flags = USEROBJECTFLAGS::default();
            let found = GetUserObjectInformationW(
                HANDLE(station.0),
                UOI_FLAGS,
                Some(&mut flags as *mut USEROBJECTFLAGS as *mut c_void),
                std::mem::size_of::<USEROBJECTFLAGS>() as u32,
                None,
            );
            match found {
                Ok(()) => flags.dwFlags & WSF_VISIBLE != 0,
                Err(_) => true,
            }
        }
    }

    fn create_event(&self) -> Result<OwnedHandle, PlatformError> {
        let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|e| PlatformError::Os {
                op: "create event",
                source: os_error(e),
            })?;
        Ok(Box::new(Win32Handle(event)))
    }

    fn create_signal_pipe(&self) -> Result<SignalPipe, PlatformError> {
        let mut read = HANDLE::default();
        let mut write = HANDLE::default();
        unsafe { CreatePipe(&mut read, &mut write, None, 0) }
            .map_err(|e| PlatformError::Os {
                op: "create pipe",
                source: os_error(e),
            })?;
        Ok(SignalPipe {
            ours: Box::new(Win32Handle(read)),
            theirs: Box::new(Win32Handle(write)),
        })
    }

    fn duplicate_current_process(&self) -> Result<OwnedHandle, PlatformError> {
        let mut process = HANDLE::default();
        unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                GetCurrentProcess(),
                GetCurrentProcess(),
                &mut process,
                PROCESS_SYNCHRONIZE.0,
                false,
                DUPLICATE_HANDLE_OPTIONS(0),
            )
        }
        .map_err(|e| PlatformError::Os {
            op: "duplicate process handle",
            source: os_error(e),
        })?;
        Ok(Box::new(Win32Handle(process)))
    }

    fn wait_for_exit(&self, process: &dyn KernelObject) {
        let handle = HANDLE(process.raw().0 as *mut c_void);
        let result = unsafe { WaitForSingleObject(handle, INFINITE) };
        debug!(handle = %process.raw(), result = result.0, "process exited");
    }
}

#[interface("E686C757-9A35-4A1C-B3CE-0BCC8B5C69F4")]
unsafe trait IConsoleHandoff: IUnknown {
    fn EstablishHandoff(
        &self,
        server: HANDLE,
        input_event: HANDLE,
        msg: *const PortableAttachMsg,
        signal_pipe: HANDLE,
        inbox_process: HANDLE,
        process: *mut HANDLE,
    ) -> HRESULT;
}

/// COM initialization for the calling thread, undone on drop
struct Apartment;

impl Apartment {
    fn enter() -> Result<Self, HandoffError> {
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
            .ok()
            .map_err(|e| HandoffError::Activation(e.to_string()))?;
        Ok(Apartment)
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        unsafe { CoUninitialize() };
    }
}

/// A handler instance; released before the apartment it lives in
struct ComHandoff {
    handoff: IConsoleHandoff,
    _apartment: Apartment,
}

impl ConsoleHandoff for ComHandoff {
    fn establish_handoff(
        &self,
        server: RawHandle,
        input_event: RawHandle,
        msg: &PortableAttachMsg,
        signal_pipe: RawHandle,
        inbox_process: RawHandle,
    ) -> io::Result<OwnedHandle> {
        let handle = |raw: RawHandle| HANDLE(raw.0 as *mut c_void);
        let mut representative = HANDLE::default();
        unsafe {
            self.handoff.EstablishHandoff(
                handle(server),
                handle(input_event),
                msg,
                handle(signal_pipe),
                handle(inbox_process),
                &mut representative,
            )
        }
        .ok()
        .map_err(os_error)?;
        Ok(Box::new(Win32Handle(representative)))
    }
}

/// Activates registered handlers out of process on the local machine
#[derive(Debug, Default)]
pub struct ComHandoffActivator;

impl HandoffActivator for ComHandoffActivator {
    fn activate(&self, target: &HandoffTargetId) -> Result<Box<dyn ConsoleHandoff>, HandoffError> {
        let apartment = Apartment::enter()?;
        let clsid = GUID::from_u128(target.0.as_u128());
        let handoff: IConsoleHandoff = unsafe { CoCreateInstance(&clsid, None, CLSCTX_LOCAL_SERVER) }
            .map_err(|e| {
                warn!(clsid = %target, "handoff handler activation failed: {}", e);
                HandoffError::Activation(e.to_string())
            })?;
        Ok(Box::new(ComHandoff {
            handoff,
            _apartment: apartment,
        }))
    }
}
