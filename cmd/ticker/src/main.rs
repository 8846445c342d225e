//! Timer demo: coarse periodic ticks cut off by a ring-enforced deadline.

use std::time::Duration;

use spindle::{Error, Runtime, Timer};

fn main() -> spindle::Result<()> {
    let rt = Runtime::new()?;
    let timer = Timer::new(&rt)?;

    {
        let timer = timer.clone();
        rt.spawn(move |rt| {
            let mut ticks = 0u32;
            let outcome = rt.timeout(
                Duration::from_secs(2),
                Some(Error::Cancelled),
                None,
                || {
                    timer.every(Duration::from_millis(250), || {
                        ticks += 1;
                        println!("tick {}", ticks);
                        Ok(())
                    })
                },
            );
            match outcome {
                Err(Error::Cancelled) => println!("deadline reached after {} ticks", ticks),
                other => other?,
            }
            timer.stop();
            Ok(())
        })?;
    }

    rt.run()
}
