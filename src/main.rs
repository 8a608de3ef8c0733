#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;
    use serial::serial_println;

    /// The kernels main after being handed off from the boot stub
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        vireo_os::init();
        serial_println!("vireo: {:?}", vireo_os::task_summary());

        unsafe { vireo_os::PICS.lock().initialize() };
        x86_64::instructions::interrupts::enable();

        loop {
            vireo_os::yield_now();
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("{}", info);
        vireo_os::halt_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
